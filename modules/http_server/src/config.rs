use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// HTTP server configuration, section `http`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct HttpConfig {
    /// Listen address. A leading `:` means all interfaces.
    pub address: String,
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    /// Accepted for compatibility with existing files; idle HTTP connections
    /// are not closed by this value. Dead peers are reaped by TCP keep-alive.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            address: ":8080".to_string(),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(120),
            shutdown_timeout: Duration::from_secs(30),
            cert_file: None,
            key_file: None,
        }
    }
}

impl HttpConfig {
    /// Certificate and key, when both are set.
    pub fn tls_files(&self) -> Option<(&str, &str)> {
        match (self.cert_file.as_deref(), self.key_file.as_deref()) {
            (Some(cert), Some(key)) if !cert.is_empty() && !key.is_empty() => Some((cert, key)),
            _ => None,
        }
    }
}

/// Resolve a listen address such as `:8080`, `127.0.0.1:0` or `localhost:9000`.
pub async fn resolve_addr(address: &str) -> anyhow::Result<SocketAddr> {
    let address = address.trim();
    let full = if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    };
    tokio::net::lookup_host(full)
        .await?
        .next()
        .ok_or_else(|| anyhow::anyhow!("address '{address}' resolved to nothing"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = HttpConfig::default();
        assert_eq!(cfg.address, ":8080");
        assert_eq!(cfg.read_timeout, Duration::from_secs(5));
        assert_eq!(cfg.write_timeout, Duration::from_secs(10));
        assert_eq!(cfg.idle_timeout, Duration::from_secs(120));
        assert_eq!(cfg.shutdown_timeout, Duration::from_secs(30));
        assert!(cfg.tls_files().is_none());
    }

    #[test]
    fn humantime_durations_parse() {
        let cfg: HttpConfig =
            serde_json::from_value(serde_json::json!({"address": "127.0.0.1:0", "shutdown_timeout": "250ms"}))
                .unwrap();
        assert_eq!(cfg.shutdown_timeout, Duration::from_millis(250));
        assert_eq!(cfg.idle_timeout, Duration::from_secs(120));
    }

    #[test]
    fn tls_needs_both_files() {
        let mut cfg = HttpConfig {
            cert_file: Some("cert.pem".into()),
            ..Default::default()
        };
        assert!(cfg.tls_files().is_none());
        cfg.key_file = Some("key.pem".into());
        assert_eq!(cfg.tls_files(), Some(("cert.pem", "key.pem")));
    }

    #[tokio::test]
    async fn leading_colon_means_all_interfaces() {
        let addr = resolve_addr(":9090").await.unwrap();
        assert!(addr.ip().is_unspecified());
        assert_eq!(addr.port(), 9090);

        let addr = resolve_addr("127.0.0.1:0").await.unwrap();
        assert!(addr.ip().is_loopback());
    }
}
