//! Configuration loading from environment variables.

use std::env;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Trader credentials for live order submission.
///
/// Absent credentials put the execution module on the simulation path.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    pub private_key: String,
    pub funder_address: Option<String>,
}

/// Application configuration loaded from environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,

    /// Coinbase spot price API base URL
    pub coinbase_api_url: String,

    /// Coinbase Exchange API base URL (candles)
    pub coinbase_exchange_url: String,

    /// Gamma API base URL (market discovery)
    pub gamma_api_url: String,

    /// CLOB REST API base URL (orderbook + orders)
    pub clob_api_url: String,

    /// Optional forward proxy for venue traffic
    pub proxy_url: Option<String>,

    /// Trader credentials; `None` runs the bot in simulation
    pub credentials: Option<Credentials>,

    /// Underlying assets to trade
    pub assets: Vec<String>,

    /// Main trading loop period in seconds
    pub loop_interval_secs: u64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required variables:
    /// - DATABASE_URL: PostgreSQL connection string
    ///
    /// Optional variables (with defaults):
    /// - COINBASE_API_URL, COINBASE_EXCHANGE_URL
    /// - GAMMA_API_URL, CLOB_API_URL
    /// - PROXY_URL
    /// - POLYMARKET_API_KEY, POLYMARKET_API_SECRET, WALLET_PRIVATE_KEY,
    ///   POLYMARKET_FUNDER_ADDRESS
    /// - TRADING_ASSETS: comma-separated (default: BTC,ETH,SOL)
    /// - LOOP_INTERVAL_SECS: trading loop period (default: 60)
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present
        dotenvy::dotenv().ok();
        Self::from_env_only()
    }

    /// Load configuration from environment variables only (no .env file).
    /// Useful for testing.
    pub fn from_env_only() -> Result<Self, ConfigError> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let coinbase_api_url = env::var("COINBASE_API_URL")
            .unwrap_or_else(|_| "https://api.coinbase.com".to_string());

        let coinbase_exchange_url = env::var("COINBASE_EXCHANGE_URL")
            .unwrap_or_else(|_| "https://api.exchange.coinbase.com".to_string());

        let gamma_api_url = env::var("GAMMA_API_URL")
            .unwrap_or_else(|_| "https://gamma-api.polymarket.com".to_string());

        let clob_api_url =
            env::var("CLOB_API_URL").unwrap_or_else(|_| "https://clob.polymarket.com".to_string());

        let proxy_url = env::var("PROXY_URL").ok().filter(|s| !s.is_empty());

        let credentials = Self::credentials_from_env();

        let assets = env::var("TRADING_ASSETS")
            .unwrap_or_else(|_| "BTC,ETH,SOL".to_string())
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        if assets.is_empty() {
            return Err(ConfigError::InvalidValue(
                "TRADING_ASSETS".to_string(),
                "no assets configured".to_string(),
            ));
        }

        let loop_interval_secs = env::var("LOOP_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);

        Ok(Self {
            database_url,
            coinbase_api_url,
            coinbase_exchange_url,
            gamma_api_url,
            clob_api_url,
            proxy_url,
            credentials,
            assets,
            loop_interval_secs,
        })
    }

    fn credentials_from_env() -> Option<Credentials> {
        let api_key = env::var("POLYMARKET_API_KEY").ok().filter(|s| !s.is_empty())?;
        let api_secret = env::var("POLYMARKET_API_SECRET")
            .ok()
            .filter(|s| !s.is_empty())?;
        let private_key = env::var("WALLET_PRIVATE_KEY").ok().filter(|s| !s.is_empty())?;
        let funder_address = env::var("POLYMARKET_FUNDER_ADDRESS")
            .ok()
            .filter(|s| !s.is_empty());

        Some(Credentials {
            api_key,
            api_secret,
            private_key,
            funder_address,
        })
    }

    /// Spot pair name for an asset, e.g. `BTC-USD`.
    pub fn spot_pair(asset: &str) -> String {
        format!("{}-USD", asset.to_uppercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for var in [
            "DATABASE_URL",
            "COINBASE_API_URL",
            "COINBASE_EXCHANGE_URL",
            "GAMMA_API_URL",
            "CLOB_API_URL",
            "PROXY_URL",
            "POLYMARKET_API_KEY",
            "POLYMARKET_API_SECRET",
            "WALLET_PRIVATE_KEY",
            "POLYMARKET_FUNDER_ADDRESS",
            "TRADING_ASSETS",
            "LOOP_INTERVAL_SECS",
        ] {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn missing_database_url_is_an_error() {
        clear_env();

        let result = Config::from_env_only();
        assert!(result.is_err());

        if let Err(ConfigError::MissingVar(var)) = result {
            assert_eq!(var, "DATABASE_URL");
        } else {
            panic!("Expected MissingVar error");
        }
    }

    #[test]
    #[serial]
    fn defaults_apply() {
        clear_env();
        env::set_var("DATABASE_URL", "postgres://localhost/trader");

        let config = Config::from_env_only().unwrap();

        assert_eq!(config.coinbase_api_url, "https://api.coinbase.com");
        assert_eq!(config.gamma_api_url, "https://gamma-api.polymarket.com");
        assert_eq!(config.clob_api_url, "https://clob.polymarket.com");
        assert_eq!(config.assets, vec!["BTC", "ETH", "SOL"]);
        assert_eq!(config.loop_interval_secs, 60);
        assert!(config.proxy_url.is_none());
        assert!(config.credentials.is_none());

        env::remove_var("DATABASE_URL");
    }

    #[test]
    #[serial]
    fn credentials_require_all_core_vars() {
        clear_env();
        env::set_var("DATABASE_URL", "postgres://localhost/trader");
        env::set_var("POLYMARKET_API_KEY", "key");
        env::set_var("POLYMARKET_API_SECRET", "secret");

        // Missing private key: still simulation
        let config = Config::from_env_only().unwrap();
        assert!(config.credentials.is_none());

        env::set_var("WALLET_PRIVATE_KEY", "0xabc");
        let config = Config::from_env_only().unwrap();
        let creds = config.credentials.expect("credentials should be present");
        assert_eq!(creds.api_key, "key");
        assert!(creds.funder_address.is_none());

        clear_env();
    }

    #[test]
    #[serial]
    fn assets_parse_and_uppercase() {
        clear_env();
        env::set_var("DATABASE_URL", "postgres://localhost/trader");
        env::set_var("TRADING_ASSETS", "btc, eth ,SOL");

        let config = Config::from_env_only().unwrap();
        assert_eq!(config.assets, vec!["BTC", "ETH", "SOL"]);

        clear_env();
    }

    #[test]
    fn spot_pair_format() {
        assert_eq!(Config::spot_pair("btc"), "BTC-USD");
        assert_eq!(Config::spot_pair("ETH"), "ETH-USD");
    }
}
