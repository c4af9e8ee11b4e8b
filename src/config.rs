//! Server configuration. Every flag can also be set through the environment.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::SyncError;
use crate::orchestrator::SyncSettings;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "opensplit-sync",
    about = "Identity reconciliation and invite service for OpenSplit",
    version
)]
pub struct Config {
    /// MongoDB connection string.
    #[arg(long, env = "MONGODB_URI")]
    pub mongodb_uri: String,
    #[arg(long, env = "OPENSPLIT_DATABASE", default_value = "OpenSplit")]
    pub database: String,
    #[arg(long, env = "BIND_HOST", default_value = "0.0.0.0")]
    pub bind_host: String,
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,
    /// Key for the signed session header.
    #[arg(long, env = "SESSION_SECRET", hide_env_values = true)]
    pub session_secret: Option<String>,
    /// Prefix of shareable invite links; the token id is appended.
    #[arg(long, env = "INVITE_BASE_URL", default_value = "https://opensplit.app/invite")]
    pub invite_base_url: String,
    /// Minimum seconds between two link-state reconciliations.
    #[arg(long, env = "LINK_DEBOUNCE_SECS", default_value_t = 30)]
    pub link_debounce_secs: i64,
    /// Quiet period before a queued cache snapshot is written.
    #[arg(long, env = "PERSIST_DELAY_MS", default_value_t = 500)]
    pub persist_delay_ms: u64,
    #[arg(long, env = "CACHE_DIR", default_value = "./cache")]
    pub cache_dir: PathBuf,
    /// Remote calls slower than this fail with a timeout.
    #[arg(long, env = "FETCH_TIMEOUT_SECS", default_value_t = 15)]
    pub fetch_timeout_secs: u64,
}

impl Config {
    pub fn session_secret(&self) -> Result<&str, SyncError> {
        self.session_secret
            .as_deref()
            .map(str::trim)
            .filter(|secret| !secret.is_empty())
            .ok_or(SyncError::ConfigurationMissing("SESSION_SECRET"))
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            link_debounce: chrono::Duration::seconds(self.link_debounce_secs.max(0)),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
        }
    }

    pub fn persist_delay(&self) -> Duration {
        Duration::from_millis(self.persist_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let argv = std::iter::once("opensplit-sync").chain(args.iter().copied());
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_apply_when_only_the_uri_is_given() {
        let config = parse(&["--mongodb-uri", "mongodb://db:27017", "--session-secret", "s3"]);
        assert_eq!(config.database, "OpenSplit");
        assert_eq!(config.port, 8080);
        assert_eq!(config.invite_base_url, "https://opensplit.app/invite");
        assert_eq!(config.persist_delay(), Duration::from_millis(500));
        assert_eq!(config.sync_settings().link_debounce, chrono::Duration::seconds(30));
        assert_eq!(config.session_secret().unwrap(), "s3");
    }

    #[test]
    fn blank_session_secret_is_missing_configuration() {
        let config = parse(&["--mongodb-uri", "mongodb://db", "--session-secret", "  "]);
        assert!(matches!(
            config.session_secret(),
            Err(SyncError::ConfigurationMissing("SESSION_SECRET"))
        ));
    }
}
