//! Service configuration

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Path the gateway posts webhooks to and redirects customers through.
pub const CALLBACK_PATH: &str = "/api/payments/paymob/callback";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayMode { Test, Production }

/// Payment gateway credentials and endpoints
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub mode: GatewayMode,
    /// API root, e.g. `https://accept.paymobsolutions.com/api`
    pub base_url: String,
    pub api_key: String,
    pub iframe_id: String,
    pub integration_id: String,
    /// Shared secret for callback HMACs
    pub hmac_secret: String,
    pub currency: String,
    /// Lifetime of an issued payment key
    pub key_expiration_secs: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// development | staging | production
    pub environment: String,
    /// PostgreSQL URL; the in-memory store is used when absent
    pub database_url: Option<String>,
    pub port: u16,
    pub nats_url: Option<String>,
    /// Public base URL of this service, used to build the gateway callback URL
    pub server_base_url: String,
    /// URI scheme registered by the mobile app
    pub deep_link_scheme: String,
    pub gateway: GatewayConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, BoxError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, BoxError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let environment = var("ENVIRONMENT").unwrap_or_else(|| "development".into());

        let mode = match var("PAYMOB_MODE").as_deref() {
            Some("production") => GatewayMode::Production,
            Some("test") | None => GatewayMode::Test,
            Some(other) => return Err(format!("PAYMOB_MODE must be test or production, got {other}").into()),
        };
        let prefix = match mode { GatewayMode::Test => "PAYMOB_TEST_", GatewayMode::Production => "PAYMOB_PRODUCTION_" };
        // mode-specific value first, then the unprefixed one
        let gateway_var = |suffix: &str| var(&format!("{prefix}{suffix}")).or_else(|| var(&format!("PAYMOB_{suffix}")));
        let require = |suffix: &str| -> Result<String, BoxError> {
            match gateway_var(suffix) {
                Some(v) => Ok(v),
                None if environment == "development" => Ok(format!("dev-paymob-{}-not-for-production", suffix.to_lowercase())),
                None => Err(format!("PAYMOB_{suffix} must be set in {environment} environment").into()),
            }
        };

        let gateway = GatewayConfig {
            mode,
            base_url: var("PAYMOB_BASE_URL")
                .unwrap_or_else(|| "https://accept.paymobsolutions.com/api".into())
                .trim_end_matches('/')
                .to_string(),
            api_key: require("API_KEY")?,
            iframe_id: require("IFRAME_ID")?,
            integration_id: require("INTEGRATION_ID")?,
            hmac_secret: require("HMAC_SECRET")?,
            currency: var("PAYMOB_CURRENCY").unwrap_or_else(|| "EGP".into()),
            key_expiration_secs: var("PAYMOB_KEY_EXPIRATION_SECS").and_then(|v| v.parse().ok()).unwrap_or(3600),
        };

        Ok(Self {
            database_url: var("DATABASE_URL"),
            port: var("PORT").and_then(|p| p.parse().ok()).unwrap_or(8083),
            nats_url: var("NATS_URL"),
            server_base_url: var("SERVER_BASE_URL")
                .unwrap_or_else(|| "http://localhost:8083".into())
                .trim_end_matches('/')
                .to_string(),
            deep_link_scheme: var("DEEP_LINK_SCHEME").unwrap_or_else(|| "sehaty".into()),
            environment,
            gateway,
        })
    }

    pub fn callback_url(&self) -> String { format!("{}{CALLBACK_PATH}", self.server_base_url) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_development_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.port, 8083);
        assert_eq!(config.deep_link_scheme, "sehaty");
        assert_eq!(config.gateway.mode, GatewayMode::Test);
        assert_eq!(config.gateway.currency, "EGP");
        assert!(config.database_url.is_none());
        assert_eq!(config.callback_url(), "http://localhost:8083/api/payments/paymob/callback");
    }

    #[test]
    fn test_mode_specific_credentials_win() {
        let config = Config::from_lookup(lookup(&[
            ("PAYMOB_MODE", "production"),
            ("PAYMOB_API_KEY", "generic"),
            ("PAYMOB_PRODUCTION_API_KEY", "prod"),
            ("SERVER_BASE_URL", "https://api.example.com/"),
        ])).unwrap();
        assert_eq!(config.gateway.api_key, "prod");
        assert_eq!(config.callback_url(), "https://api.example.com/api/payments/paymob/callback");
    }

    #[test]
    fn test_production_requires_secrets() {
        let err = Config::from_lookup(lookup(&[("ENVIRONMENT", "production")])).unwrap_err();
        assert!(err.to_string().contains("PAYMOB_API_KEY"));
    }
}
