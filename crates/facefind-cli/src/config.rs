use facefind_core::fetch::{DEFAULT_FETCH_TIMEOUT, DEFAULT_MAX_IMAGE_BYTES};
use facefind_core::FetchConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Default cosine similarity a stored face must exceed to count as a match.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.40;

/// CLI configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine similarity a match must strictly exceed.
    pub similarity_threshold: f32,
    /// Overall timeout for fetching a remote image.
    pub fetch_timeout_secs: u64,
    /// Largest remote image accepted, in bytes.
    pub max_image_bytes: u64,
}

impl Config {
    /// Load configuration from `FACEFIND_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let model_dir = get("FACEFIND_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(facefind_core::default_model_dir);

        let db_path = get("FACEFIND_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| facefind_core::default_data_dir().join("facefind.db"));

        Self {
            model_dir,
            db_path,
            similarity_threshold: parse_or(&get, "FACEFIND_SIMILARITY_THRESHOLD", DEFAULT_SIMILARITY_THRESHOLD),
            fetch_timeout_secs: parse_or(&get, "FACEFIND_FETCH_TIMEOUT_SECS", DEFAULT_FETCH_TIMEOUT.as_secs()),
            max_image_bytes: parse_or(&get, "FACEFIND_MAX_IMAGE_BYTES", DEFAULT_MAX_IMAGE_BYTES),
        }
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            timeout: Duration::from_secs(self.fetch_timeout_secs),
            max_bytes: self.max_image_bytes,
        }
    }
}

fn parse_or<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    get(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with(vars: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config_with(&[]);
        assert_eq!(cfg.similarity_threshold, DEFAULT_SIMILARITY_THRESHOLD);
        assert_eq!(cfg.fetch_timeout_secs, 10);
        assert_eq!(cfg.max_image_bytes, 20 * 1024 * 1024);
        assert!(cfg.db_path.ends_with("facefind/facefind.db"), "{}", cfg.db_path.display());
        assert!(cfg.model_dir.ends_with("facefind/models"));
    }

    #[test]
    fn test_overrides() {
        let cfg = config_with(&[
            ("FACEFIND_MODEL_DIR", "/opt/models"),
            ("FACEFIND_DB_PATH", "/var/lib/facefind/photos.db"),
            ("FACEFIND_SIMILARITY_THRESHOLD", " 0.55 "),
            ("FACEFIND_FETCH_TIMEOUT_SECS", "3"),
            ("FACEFIND_MAX_IMAGE_BYTES", "1048576"),
        ]);
        assert_eq!(cfg.model_dir, PathBuf::from("/opt/models"));
        assert_eq!(cfg.db_path, PathBuf::from("/var/lib/facefind/photos.db"));
        assert!((cfg.similarity_threshold - 0.55).abs() < 1e-6);

        let fetch = cfg.fetch_config();
        assert_eq!(fetch.timeout, Duration::from_secs(3));
        assert_eq!(fetch.max_bytes, 1_048_576);
    }

    #[test]
    fn test_unparsable_values_fall_back() {
        let cfg = config_with(&[
            ("FACEFIND_SIMILARITY_THRESHOLD", "high"),
            ("FACEFIND_FETCH_TIMEOUT_SECS", "-1"),
        ]);
        assert_eq!(cfg.similarity_threshold, DEFAULT_SIMILARITY_THRESHOLD);
        assert_eq!(cfg.fetch_timeout_secs, 10);
    }
}
