//! Configuration module for the content sync backend.
//!
//! All configuration is loaded from environment variables with sensible defaults.
//! The network layout (site URLs, upload roots, REST roots) is derived from it.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Site id of the network's main site. Its uploads live directly under the upload root.
pub const MAIN_SITE_ID: i64 = 1;

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" | "" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected text or json, got {:?}", other)),
        }
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Pre-shared key for the admin API (required in production)
    pub api_psk: Option<String>,
    /// Path to SQLite database file
    pub db_path: PathBuf,
    /// Root directory of the network's uploads
    pub uploads_root: PathBuf,
    /// Address to bind the server to
    pub bind_addr: SocketAddr,
    /// Public origin of this network, used for site URLs and outbound pushes
    pub base_url: String,
    /// Site acting as the authoritative central node
    pub central_site_id: i64,
    /// Timeout for every cross-node call
    pub push_timeout: Duration,
    /// Objects per bulk batch
    pub bulk_batch_size: usize,
    /// Idle poll interval of the media worker
    pub media_poll_interval: Duration,
    /// Extra recipients for rejection notices
    pub notify_emails: Vec<String>,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Plain text or one JSON object per line
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, String> {
        dotenvy::dotenv().ok();

        let api_psk = env::var("CCM_API_PSK").ok().filter(|s| !s.is_empty());

        let db_path = env::var("CCM_DB_PATH")
            .unwrap_or_else(|_| "./data/ccm.sqlite".to_string())
            .into();

        let uploads_root = env::var("CCM_UPLOADS_ROOT")
            .unwrap_or_else(|_| "./data/uploads".to_string())
            .into();

        let bind_addr = env::var("CCM_BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .map_err(|e| format!("Invalid CCM_BIND_ADDR format: {}", e))?;

        let base_url = env::var("CCM_BASE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string())
            .trim_end_matches('/')
            .to_string();

        let central_site_id = parse_var("CCM_CENTRAL_SITE_ID", MAIN_SITE_ID)?;
        let push_timeout = Duration::from_secs(parse_var("CCM_PUSH_TIMEOUT_SECS", 10)?);
        let bulk_batch_size = parse_var::<usize>("CCM_BULK_BATCH_SIZE", 2)?.max(1);
        let media_poll_interval = Duration::from_millis(parse_var("CCM_MEDIA_POLL_MS", 2000)?);

        let notify_emails = env::var("CCM_NOTIFY_EMAILS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let log_level = env::var("CCM_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let log_format = parse_var("CCM_LOG_FORMAT", LogFormat::Text)?;

        Ok(Self {
            api_psk,
            db_path,
            uploads_root,
            bind_addr,
            base_url,
            central_site_id,
            push_timeout,
            bulk_batch_size,
            media_poll_interval,
            notify_emails,
            log_level,
            log_format,
        })
    }

    /// Public URL of a site.
    pub fn site_url(&self, site_id: i64) -> String {
        format!("{}/sites/{}", self.base_url, site_id)
    }

    /// REST root of a site's sync endpoints.
    pub fn rest_url(&self, site_id: i64) -> String {
        format!("{}/ccm/v1", self.site_url(site_id))
    }

    /// Public URL of a site's upload root.
    pub fn uploads_url(&self, site_id: i64) -> String {
        if site_id == MAIN_SITE_ID {
            format!("{}/uploads", self.base_url)
        } else {
            format!("{}/uploads/sites/{}", self.base_url, site_id)
        }
    }

    /// Filesystem directory of a site's upload root.
    pub fn uploads_dir(&self, site_id: i64) -> PathBuf {
        if site_id == MAIN_SITE_ID {
            self.uploads_root.clone()
        } else {
            self.uploads_root.join("sites").join(site_id.to_string())
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| format!("Invalid {} value: {}", name, e)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        // Clear any existing env vars
        for name in [
            "CCM_API_PSK",
            "CCM_DB_PATH",
            "CCM_UPLOADS_ROOT",
            "CCM_BIND_ADDR",
            "CCM_BASE_URL",
            "CCM_CENTRAL_SITE_ID",
            "CCM_PUSH_TIMEOUT_SECS",
            "CCM_BULK_BATCH_SIZE",
            "CCM_MEDIA_POLL_MS",
            "CCM_NOTIFY_EMAILS",
            "CCM_LOG_LEVEL",
            "CCM_LOG_FORMAT",
        ] {
            env::remove_var(name);
        }

        let config = Config::from_env().unwrap();

        assert!(config.api_psk.is_none());
        assert_eq!(config.db_path, PathBuf::from("./data/ccm.sqlite"));
        assert_eq!(config.uploads_root, PathBuf::from("./data/uploads"));
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:8080");
        assert_eq!(config.central_site_id, 1);
        assert_eq!(config.push_timeout, Duration::from_secs(10));
        assert_eq!(config.bulk_batch_size, 2);
        assert!(config.notify_emails.is_empty());
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn log_format_parses_case_insensitively() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!(" text ".parse::<LogFormat>(), Ok(LogFormat::Text));
        assert!("yaml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn upload_roots_differ_for_main_site() {
        let mut config = Config::from_env().unwrap();
        config.base_url = "http://net.test".to_string();
        config.uploads_root = PathBuf::from("/srv/uploads");

        assert_eq!(config.uploads_url(1), "http://net.test/uploads");
        assert_eq!(config.uploads_url(5), "http://net.test/uploads/sites/5");
        assert_eq!(config.uploads_dir(5), PathBuf::from("/srv/uploads/sites/5"));
        assert_eq!(config.rest_url(7), "http://net.test/sites/7/ccm/v1");
    }
}
