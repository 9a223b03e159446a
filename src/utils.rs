use std::path::{Path, PathBuf};

use uuid::Uuid;

pub fn format_rate_limit_key(prefix: &str, key: &str) -> String {
    format!("{}:{}", prefix, key)
}

/// Unique sibling path used to stage a file before it is renamed into place.
/// Two writers staging the same target never share a staging file.
pub fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{}.tmp", Uuid::new_v4().simple()));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_path_is_a_unique_sibling() {
        let target = Path::new("data/anomalies.json");
        let first = staging_path(target);
        let second = staging_path(target);

        assert_eq!(first.parent(), target.parent());
        let name = first.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("anomalies.json."));
        assert!(name.ends_with(".tmp"));
        assert_ne!(first, second);
    }
}
