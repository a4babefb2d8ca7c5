//! Loading and validation of `pgs_conf.json`.
//!
//! Mirrors the field-by-field validation performed by the original server's config parser:
//! every required key must be present and non-null, and numeric fields are range-checked before
//! the server is allowed to start.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct RawRateLimit {
    max_requests: Option<i64>,
    time_window: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawCache {
    size_mb: Option<i64>,
    max_age_seconds: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    port: Option<i64>,
    static_folder: Option<String>,
    thread_count: Option<i64>,
    rate_limit: Option<RawRateLimit>,
    cache: Option<RawCache>,
}

/// Validated server configuration. The single source of truth for every tunable; no component
/// is permitted to carry its own defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port the listener binds.
    pub port: u16,
    /// Root directory files are served from.
    pub static_folder: PathBuf,
    /// Number of worker threads in the pool.
    pub thread_count: usize,
    /// Maximum accepted requests per client within `rate_limit_window`.
    pub rate_limit_max_requests: u32,
    /// Sliding window width, in seconds.
    pub rate_limit_window_seconds: u64,
    /// Cache byte budget, in bytes.
    pub cache_size_bytes: u64,
    /// Retained for observability; not enforced on cache read (see DESIGN.md).
    pub cache_max_age_seconds: u64,
}

/// Loads and validates configuration from `path`.
pub fn load(path: &Path) -> Result<Config> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
    let raw: RawConfig = serde_json::from_str(&text)
        .map_err(|e| Error::Config(format!("malformed JSON in {}: {e}", path.display())))?;
    validate(raw)
}

fn validate(raw: RawConfig) -> Result<Config> {
    let port = raw
        .port
        .ok_or_else(|| Error::Config("missing required field: port".into()))?;
    if !(1..=65535).contains(&port) {
        return Err(Error::Config(format!("port {port} out of range 1..=65535")));
    }

    let static_folder = raw
        .static_folder
        .ok_or_else(|| Error::Config("missing required field: static_folder".into()))?;
    let static_folder = PathBuf::from(static_folder);
    if !static_folder.exists() {
        return Err(Error::Config(format!(
            "static_folder does not exist: {}",
            static_folder.display()
        )));
    }

    let thread_count = raw
        .thread_count
        .ok_or_else(|| Error::Config("missing required field: thread_count".into()))?;
    if !(1..=1000).contains(&thread_count) {
        return Err(Error::Config(format!(
            "thread_count {thread_count} out of range 1..=1000"
        )));
    }

    let rate_limit = raw
        .rate_limit
        .ok_or_else(|| Error::Config("missing required field: rate_limit".into()))?;
    let max_requests = rate_limit
        .max_requests
        .ok_or_else(|| Error::Config("missing required field: rate_limit.max_requests".into()))?;
    if max_requests <= 0 {
        return Err(Error::Config("rate_limit.max_requests must be > 0".into()));
    }
    let time_window = rate_limit
        .time_window
        .ok_or_else(|| Error::Config("missing required field: rate_limit.time_window".into()))?;
    if time_window <= 0 {
        return Err(Error::Config("rate_limit.time_window must be > 0".into()));
    }

    let cache = raw
        .cache
        .ok_or_else(|| Error::Config("missing required field: cache".into()))?;
    let size_mb = cache
        .size_mb
        .ok_or_else(|| Error::Config("missing required field: cache.size_mb".into()))?;
    if size_mb <= 0 {
        return Err(Error::Config("cache.size_mb must be > 0".into()));
    }
    let cache_size_bytes = (size_mb as u64).checked_mul(1024 * 1024).ok_or_else(|| {
        Error::Config(format!("cache.size_mb {size_mb} overflows when converted to bytes"))
    })?;
    let max_age_seconds = cache
        .max_age_seconds
        .ok_or_else(|| Error::Config("missing required field: cache.max_age_seconds".into()))?;
    if max_age_seconds <= 0 {
        return Err(Error::Config("cache.max_age_seconds must be > 0".into()));
    }

    Ok(Config {
        port: port as u16,
        static_folder,
        thread_count: thread_count as usize,
        rate_limit_max_requests: max_requests as u32,
        rate_limit_window_seconds: time_window as u64,
        cache_size_bytes,
        cache_max_age_seconds: max_age_seconds as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_conf(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("pgs_conf.json");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let www = dir.path().join("www");
        fs::create_dir(&www).unwrap();
        let conf = format!(
            r#"{{"port":8080,"static_folder":"{}","thread_count":8,"rate_limit":{{"max_requests":100,"time_window":60}},"cache":{{"size_mb":64,"max_age_seconds":3600}}}}"#,
            www.display()
        );
        let path = write_conf(&dir, &conf);
        let cfg = load(&path).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.thread_count, 8);
        assert_eq!(cfg.cache_size_bytes, 64 * 1024 * 1024);
    }

    #[test]
    fn rejects_missing_static_folder() {
        let dir = tempfile::tempdir().unwrap();
        let conf = r#"{"port":8080,"static_folder":"/does/not/exist","thread_count":8,"rate_limit":{"max_requests":100,"time_window":60},"cache":{"size_mb":64,"max_age_seconds":3600}}"#;
        let path = write_conf(&dir, conf);
        assert!(load(&path).is_err());
    }

    #[test]
    fn rejects_out_of_range_port() {
        let dir = tempfile::tempdir().unwrap();
        let www = dir.path().join("www");
        fs::create_dir(&www).unwrap();
        let conf = format!(
            r#"{{"port":0,"static_folder":"{}","thread_count":8,"rate_limit":{{"max_requests":100,"time_window":60}},"cache":{{"size_mb":64,"max_age_seconds":3600}}}}"#,
            www.display()
        );
        let path = write_conf(&dir, &conf);
        assert!(load(&path).is_err());
    }

    #[test]
    fn rejects_cache_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let www = dir.path().join("www");
        fs::create_dir(&www).unwrap();
        let conf = format!(
            r#"{{"port":8080,"static_folder":"{}","thread_count":8,"rate_limit":{{"max_requests":100,"time_window":60}},"cache":{{"size_mb":{},"max_age_seconds":3600}}}}"#,
            www.display(),
            u64::MAX
        );
        let path = write_conf(&dir, &conf);
        assert!(load(&path).is_err());
    }
}
