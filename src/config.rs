use tracing::info;

// ---------------------------------------------------------------------------
// Call configuration — loaded from environment variables
// ---------------------------------------------------------------------------

/// Configuration for the call layer.
///
/// Every field can be set via an environment variable prefixed with
/// `ROOMLINK_`.  Defaults are suitable for development: a public STUN
/// server for NAT traversal and `info`-level logging.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// STUN server URLs handed to every peer connection's ICE agent.
    pub stun_urls: Vec<String>,

    /// Default log level for embedders that install a subscriber from it.
    pub log_level: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            stun_urls: vec!["stun:stun.l.google.com:19302".to_string()],
            log_level: "info".to_string(),
        }
    }
}

impl CallConfig {
    /// Load configuration from environment variables.
    ///
    /// Automatically loads a `.env` file if present (via `dotenvy`).
    pub fn from_env() -> Self {
        // Best-effort .env loading — ignore errors.
        let _ = dotenvy::dotenv();

        let stun_urls = env_csv(
            "ROOMLINK_STUN_URLS",
            &["stun:stun.l.google.com:19302"],
        );
        let log_level = env_or("ROOMLINK_LOG_LEVEL", "info");

        info!("call config: {} STUN url(s)", stun_urls.len());

        Self {
            stun_urls,
            log_level,
        }
    }
}

// ─── Env helpers ────────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_csv(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) => v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => default.iter().map(|s| s.to_string()).collect(),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
