use std::time::Duration;

use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Relay configuration, loaded from environment variables
// ---------------------------------------------------------------------------

/// Relay server configuration loaded at startup.
///
/// Every field can be set via an environment variable prefixed with
/// `STUDIO_RELAY_`.  Defaults are suitable for local development.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    // ── Network ─────────────────────────────────────────────────────────
    /// Address to bind the HTTP(S) listener to.
    pub bind_addr: String,

    // ── TLS ─────────────────────────────────────────────────────────────
    pub tls_enabled: bool,
    /// PEM certificate chain.
    pub tls_cert_path: Option<String>,
    /// PEM private key.
    pub tls_key_path: Option<String>,

    // ── Admission ───────────────────────────────────────────────────────
    /// Browser origins allowed to open a relay socket.  `*` allows any.
    pub allowed_origins: Vec<String>,
    /// A connection silent for this long is dropped.
    pub idle_timeout: Duration,

    // ── Logging ──────────────────────────────────────────────────────────
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".into(),
            tls_enabled: false,
            tls_cert_path: None,
            tls_key_path: None,
            allowed_origins: vec!["*".into()],
            idle_timeout: Duration::from_secs(90),
            log_level: "info".into(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from the process environment.  `main` has
    /// already folded `.env` into it.
    pub fn from_env() -> Self {
        let config = Self::from_lookup(|key| std::env::var(key).ok());
        config.log_summary();
        config
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let defaults = Self::default();

        let idle_secs = env.parse("STUDIO_RELAY_IDLE_TIMEOUT_SECS", 90u64);

        Self {
            bind_addr: env.or("STUDIO_RELAY_BIND_ADDR", &defaults.bind_addr),
            tls_enabled: env.bool("STUDIO_RELAY_TLS_ENABLED", false),
            tls_cert_path: env.get("STUDIO_RELAY_TLS_CERT_PATH"),
            tls_key_path: env.get("STUDIO_RELAY_TLS_KEY_PATH"),
            allowed_origins: env.csv("STUDIO_RELAY_ALLOWED_ORIGINS", &["*"]),
            idle_timeout: Duration::from_secs(idle_secs.max(1)),
            log_level: env.or("STUDIO_RELAY_LOG_LEVEL", &defaults.log_level),
        }
    }

    /// Whether a socket presenting `origin` may connect.
    ///
    /// Native clients send no `Origin` header and are always admitted.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return true;
        };
        self.allowed_origins
            .iter()
            .any(|o| o == "*" || o.eq_ignore_ascii_case(origin))
    }

    fn log_summary(&self) {
        info!("──── Studio Relay Configuration ────");
        info!("  bind_addr          : {}", self.bind_addr);
        info!("  tls_enabled        : {}", self.tls_enabled);
        if self.tls_enabled {
            info!(
                "  tls_cert_path      : {}",
                self.tls_cert_path.as_deref().unwrap_or("(not set)")
            );
            info!(
                "  tls_key_path       : {}",
                self.tls_key_path.as_deref().unwrap_or("(not set)")
            );
        }
        if self.allowed_origins.iter().any(|o| o == "*") {
            warn!("  allowed_origins    : * (any origin may connect)");
        } else {
            info!("  allowed_origins    : {:?}", self.allowed_origins);
        }
        info!("  idle_timeout       : {:?}", self.idle_timeout);
        info!("  log_level          : {}", self.log_level);
        info!("────────────────────────────────────");
    }
}

// ---------------------------------------------------------------------------
// Client configuration
// ---------------------------------------------------------------------------

/// Settings for a studio or remote client process (`STUDIO_CLIENT_` prefix).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `ws://` or `wss://` URL of the relay socket.
    pub relay_url: String,
    pub name: Option<String>,
    /// Remote id held from an earlier session, resubmitted on join.
    pub remote_id: Option<String>,
    pub reconnect_delay: Duration,
    pub keepalive_interval: Duration,
    /// STUN servers handed to the media transport.
    pub stun_urls: Vec<String>,
    pub channels: u8,
    pub bitrate_kbps: u32,
}

impl ClientConfig {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            name: None,
            remote_id: None,
            reconnect_delay: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(30),
            stun_urls: vec!["stun:stun.l.google.com:19302".into()],
            channels: 1,
            bitrate_kbps: 64,
        }
    }

    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let defaults = Self::new("ws://127.0.0.1:8080/ws");

        Self {
            relay_url: env.or("STUDIO_CLIENT_RELAY_URL", &defaults.relay_url),
            name: env.get("STUDIO_CLIENT_NAME"),
            remote_id: env.get("STUDIO_CLIENT_REMOTE_ID"),
            reconnect_delay: Duration::from_secs(env.parse("STUDIO_CLIENT_RECONNECT_DELAY_SECS", 5)),
            keepalive_interval: Duration::from_secs(
                env.parse("STUDIO_CLIENT_KEEPALIVE_SECS", 30u64).max(1),
            ),
            stun_urls: env.csv("STUDIO_CLIENT_STUN_URLS", &["stun:stun.l.google.com:19302"]),
            channels: env.parse("STUDIO_CLIENT_CHANNELS", defaults.channels),
            bitrate_kbps: env.parse("STUDIO_CLIENT_BITRATE_KBPS", defaults.bitrate_kbps),
        }
    }
}

// ---------------------------------------------------------------------------
// Environment helpers
// ---------------------------------------------------------------------------

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.is_empty())
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"),
            None => default,
        }
    }

    fn parse<T: std::str::FromStr + Copy>(&self, key: &str, default: T) -> T {
        match self.get(key) {
            Some(v) => v.trim().parse().unwrap_or_else(|_| {
                warn!(key, value = %v, "unparseable setting, using default");
                default
            }),
            None => default,
        }
    }

    fn csv(&self, key: &str, defaults: &[&str]) -> Vec<String> {
        match self.get(key) {
            Some(v) => v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => defaults.iter().map(|s| s.to_string()).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn relay_defaults() {
        let config = RelayConfig::from_lookup(lookup(&[]));
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
        assert!(!config.tls_enabled);
        assert!(config.origin_allowed(Some("https://anything.example")));
    }

    #[test]
    fn relay_overrides() {
        let config = RelayConfig::from_lookup(lookup(&[
            ("STUDIO_RELAY_BIND_ADDR", "127.0.0.1:9000"),
            ("STUDIO_RELAY_IDLE_TIMEOUT_SECS", "15"),
            ("STUDIO_RELAY_TLS_ENABLED", "yes"),
            (
                "STUDIO_RELAY_ALLOWED_ORIGINS",
                "https://studio.example, https://guest.example",
            ),
        ]));
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.idle_timeout, Duration::from_secs(15));
        assert!(config.tls_enabled);
        assert_eq!(config.allowed_origins.len(), 2);
    }

    #[test]
    fn origin_check() {
        let config = RelayConfig {
            allowed_origins: vec!["https://studio.example".into()],
            ..RelayConfig::default()
        };
        assert!(config.origin_allowed(Some("https://studio.example")));
        assert!(config.origin_allowed(Some("HTTPS://STUDIO.EXAMPLE")));
        assert!(!config.origin_allowed(Some("https://evil.example")));
        assert!(config.origin_allowed(None));
    }

    #[test]
    fn bad_numbers_fall_back() {
        let config = RelayConfig::from_lookup(lookup(&[("STUDIO_RELAY_IDLE_TIMEOUT_SECS", "soon")]));
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn client_defaults_and_overrides() {
        let config = ClientConfig::from_lookup(lookup(&[]));
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.keepalive_interval, Duration::from_secs(30));
        assert!(config.remote_id.is_none());

        let config = ClientConfig::from_lookup(lookup(&[
            ("STUDIO_CLIENT_RELAY_URL", "wss://relay.example/ws"),
            ("STUDIO_CLIENT_NAME", "Guest"),
            ("STUDIO_CLIENT_REMOTE_ID", "r7"),
            ("STUDIO_CLIENT_RECONNECT_DELAY_SECS", "1"),
            ("STUDIO_CLIENT_CHANNELS", "2"),
        ]));
        assert_eq!(config.relay_url, "wss://relay.example/ws");
        assert_eq!(config.name.as_deref(), Some("Guest"));
        assert_eq!(config.remote_id.as_deref(), Some("r7"));
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.channels, 2);
    }
}
