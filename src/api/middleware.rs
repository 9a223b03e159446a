//! Actix middleware putting every request through the [`Gateway`].

use std::future::{ready, Ready};
use std::rc::Rc;
use std::sync::Arc;

use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header;
use actix_web::{Error, HttpResponse};
use futures::future::LocalBoxFuture;
use serde_json::json;

use crate::core::{Gateway, Rejection, RequestInfo};

const BLOCKED_HTML: &str =
    "<h1>403 Forbidden</h1><p>Your IP has been blocked due to suspicious activity.</p>";

/// Wraps an `App` so blocklisted and over-limit clients never reach a handler
pub struct GatewayMiddleware {
    gateway: Arc<Gateway>,
}

impl GatewayMiddleware {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }
}

impl<S, B> Transform<S, ServiceRequest> for GatewayMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = GatewayService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(GatewayService {
            service: Rc::new(service),
            gateway: Arc::clone(&self.gateway),
        }))
    }
}

pub struct GatewayService<S> {
    service: Rc<S>,
    gateway: Arc<Gateway>,
}

impl<S, B> Service<ServiceRequest> for GatewayService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let gateway = Arc::clone(&self.gateway);

        Box::pin(async move {
            let info = request_info(&req);

            if let Err(rejection) = gateway.admit(&info.client_id).await {
                let response = rejection_response(&rejection, accepts_html(&req));
                return Ok(req.into_response(response).map_into_right_body());
            }

            // Dropped with this future if the client goes away mid-request.
            let timer = gateway.start(info);
            let result = service.call(req).await;
            timer.finish();

            result.map(ServiceResponse::map_into_left_body)
        })
    }
}

fn request_info(req: &ServiceRequest) -> RequestInfo {
    RequestInfo {
        client_id: req
            .peer_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        method: req.method().to_string(),
        path: req.path().to_string(),
        user_agent: req
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
    }
}

fn accepts_html(req: &ServiceRequest) -> bool {
    req.headers()
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("text/html") || accept.contains("application/xhtml+xml"))
        .unwrap_or(false)
}

fn rejection_response(rejection: &Rejection, html: bool) -> HttpResponse {
    match rejection {
        Rejection::Blocked if html => HttpResponse::Forbidden()
            .content_type("text/html; charset=utf-8")
            .body(BLOCKED_HTML),
        Rejection::Blocked => HttpResponse::Forbidden().json(json!({ "error": rejection.to_string() })),
        Rejection::RateLimitExceeded { limit, .. } => HttpResponse::TooManyRequests()
            .insert_header((header::RETRY_AFTER, limit.window.as_secs().to_string()))
            .content_type("text/plain; charset=utf-8")
            .body(rejection.to_string()),
    }
}
