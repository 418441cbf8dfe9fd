use std::time::Duration;
use thiserror::Error;
use url::Url;

const DEFAULT_RECO_URL: &str = "http://localhost:5001/reco";
const DEFAULT_RECO_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SERIES_FETCH_LIMIT: usize = 200;

const ENV_RECO_URL: &str = "LABBOOK_RECO_URL";
const ENV_RECO_TIMEOUT_SECS: &str = "LABBOOK_RECO_TIMEOUT_SECS";
const ENV_SERIES_FETCH_LIMIT: &str = "LABBOOK_SERIES_LIMIT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid recommendation service url {value}: {source}")]
    InvalidUrl {
        value: String,
        source: url::ParseError,
    },
    #[error("invalid numeric value for {name}: {value}")]
    InvalidNumber { name: &'static str, value: String },
}

/// Runtime settings for the recommendation refresh pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    /// Endpoint of the external recommendation service.
    pub reco_url: Url,
    /// Bound on the synchronous analyze round-trip.
    pub reco_timeout: Duration,
    /// Most-recent points fetched per candidate key when assembling series.
    pub series_fetch_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reco_url: Url::parse(DEFAULT_RECO_URL).expect("default reco url parses"),
            reco_timeout: Duration::from_secs(DEFAULT_RECO_TIMEOUT_SECS),
            series_fetch_limit: DEFAULT_SERIES_FETCH_LIMIT,
        }
    }
}

impl Config {
    /// Builds a config from the environment, falling back to defaults for
    /// unset variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var(ENV_RECO_URL) {
            config.reco_url = Self::parse_url(&raw)?;
        }
        if let Ok(raw) = std::env::var(ENV_RECO_TIMEOUT_SECS) {
            let secs: u64 = raw.parse().map_err(|_| ConfigError::InvalidNumber {
                name: ENV_RECO_TIMEOUT_SECS,
                value: raw,
            })?;
            config.reco_timeout = Duration::from_secs(secs);
        }
        if let Ok(raw) = std::env::var(ENV_SERIES_FETCH_LIMIT) {
            config.series_fetch_limit = raw.parse().map_err(|_| ConfigError::InvalidNumber {
                name: ENV_SERIES_FETCH_LIMIT,
                value: raw,
            })?;
        }

        Ok(config)
    }

    pub fn with_reco_url(mut self, raw: &str) -> Result<Self, ConfigError> {
        self.reco_url = Self::parse_url(raw)?;
        Ok(self)
    }

    fn parse_url(raw: &str) -> Result<Url, ConfigError> {
        Url::parse(raw).map_err(|source| ConfigError::InvalidUrl {
            value: raw.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, ConfigError};
    use std::time::Duration;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.reco_url.as_str(), "http://localhost:5001/reco");
        assert_eq!(config.reco_timeout, Duration::from_secs(30));
        assert_eq!(config.series_fetch_limit, 200);
    }

    #[test]
    fn rejects_invalid_urls() {
        let result = Config::default().with_reco_url("not a url");
        assert!(matches!(result, Err(ConfigError::InvalidUrl { .. })));
    }

    #[test]
    fn accepts_override_urls() {
        let config = Config::default()
            .with_reco_url("http://127.0.0.1:9999/analyze")
            .expect("valid url");
        assert_eq!(config.reco_url.as_str(), "http://127.0.0.1:9999/analyze");
    }

    #[test]
    fn from_env_honors_overrides() {
        std::env::set_var(super::ENV_RECO_URL, "http://10.0.0.5:8080/reco");
        std::env::set_var(super::ENV_RECO_TIMEOUT_SECS, "5");
        std::env::set_var(super::ENV_SERIES_FETCH_LIMIT, "50");

        let config = Config::from_env().expect("config from env");
        std::env::remove_var(super::ENV_RECO_URL);
        std::env::remove_var(super::ENV_RECO_TIMEOUT_SECS);
        std::env::remove_var(super::ENV_SERIES_FETCH_LIMIT);

        assert_eq!(config.reco_url.as_str(), "http://10.0.0.5:8080/reco");
        assert_eq!(config.reco_timeout, Duration::from_secs(5));
        assert_eq!(config.series_fetch_limit, 50);
    }
}
