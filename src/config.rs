use std::{env, time::Duration};
use thiserror::Error;
use urlencoding::encode;

const DEFAULT_SCOPES: &[&str] = &[
    "https://api.ebay.com/oauth/api_scope",
    "https://api.ebay.com/oauth/api_scope/sell.fulfillment.readonly",
    "https://api.ebay.com/oauth/api_scope/sell.finances",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub ebay: EbayConfig,
    pub http: HttpSettings,
    pub scheduler: SchedulerSettings,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub cache_ttl_secs: u64,
    pub port: u16,
}

impl Settings {
    /// Reads every setting once at startup. Missing eBay credentials are fatal.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            ebay: EbayConfig::from_env()?,
            http: HttpSettings::from_env()?,
            scheduler: SchedulerSettings::from_env()?,
            database_url: optional("DATABASE_URL"),
            redis_url: optional("REDIS_URL"),
            cache_ttl_secs: parse_or("FINANCIALS_CACHE_TTL_SECS", 900)?,
            port: parse_or("PORT", 8000)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EbayEnvironment {
    Sandbox,
    Production,
}

impl EbayEnvironment {
    fn from_raw(value: &str) -> Self {
        if value.eq_ignore_ascii_case("PROD") || value.eq_ignore_ascii_case("PRODUCTION") {
            Self::Production
        } else {
            Self::Sandbox
        }
    }

    fn api_root(self) -> &'static str {
        match self {
            Self::Production => "https://api.ebay.com",
            Self::Sandbox => "https://api.sandbox.ebay.com",
        }
    }

    fn auth_root(self) -> &'static str {
        match self {
            Self::Production => "https://auth.ebay.com",
            Self::Sandbox => "https://auth.sandbox.ebay.com",
        }
    }
}

/// Application credentials and endpoint roots for one eBay environment.
#[derive(Debug, Clone)]
pub struct EbayConfig {
    pub environment: EbayEnvironment,
    pub app_id: String,
    pub cert_id: String,
    pub dev_id: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub site_id: u32,
    pub api_root: String,
    pub auth_root: String,
}

impl EbayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment =
            EbayEnvironment::from_raw(&env::var("EBAY_ENV").unwrap_or_else(|_| "SANDBOX".into()));
        let scopes = optional("EBAY_SCOPES")
            .map(|raw| raw.split_whitespace().map(str::to_string).collect())
            .unwrap_or_else(|| DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect());
        Ok(Self {
            environment,
            app_id: required("EBAY_APP_ID")?,
            cert_id: required("EBAY_CERT_ID")?,
            dev_id: optional("EBAY_DEV_ID").unwrap_or_default(),
            redirect_uri: required("EBAY_REDIRECT_URI")?,
            scopes,
            site_id: parse_or("EBAY_SITE_ID", 0)?,
            api_root: optional("EBAY_API_ROOT")
                .unwrap_or_else(|| environment.api_root().to_string())
                .trim_end_matches('/')
                .to_string(),
            auth_root: optional("EBAY_AUTH_ROOT")
                .unwrap_or_else(|| environment.auth_root().to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }

    pub fn token_url(&self) -> String {
        format!("{}/identity/v1/oauth2/token", self.api_root)
    }

    pub fn authorize_url(&self) -> String {
        format!("{}/oauth2/authorize", self.auth_root)
    }

    /// Consent URL the browser is redirected to.
    pub fn consent_url(&self, state: &str) -> String {
        format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&state={}",
            self.authorize_url(),
            encode(&self.app_id),
            encode(&self.redirect_uri),
            encode(&self.scopes.join(" ")),
            encode(state),
        )
    }

    pub fn trading_url(&self) -> String {
        format!("{}/ws/api.dll", self.api_root)
    }

    #[cfg(test)]
    pub fn for_tests(root: &str) -> Self {
        Self {
            environment: EbayEnvironment::Sandbox,
            app_id: "test-app".into(),
            cert_id: "test-cert".into(),
            dev_id: "test-dev".into(),
            redirect_uri: "Test-RuName".into(),
            scopes: vec!["https://api.ebay.com/oauth/api_scope".into()],
            site_id: 0,
            api_root: root.trim_end_matches('/').to_string(),
            auth_root: root.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl HttpSettings {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            timeout: Duration::from_secs(parse_or("HTTP_TIMEOUT_SECS", 15)?),
            connect_timeout: Duration::from_secs(parse_or("HTTP_CONNECT_TIMEOUT_SECS", 5)?),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub enabled: bool,
    pub interval: Duration,
    pub threshold: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(15 * 60),
            threshold: Duration::from_secs(20 * 60),
        }
    }
}

impl SchedulerSettings {
    fn from_env() -> Result<Self, ConfigError> {
        let interval: u64 = parse_or("TOKEN_REFRESH_INTERVAL_SECS", 15 * 60)?;
        if interval == 0 {
            return Err(ConfigError::Invalid {
                name: "TOKEN_REFRESH_INTERVAL_SECS",
                value: "0".into(),
            });
        }
        Ok(Self {
            enabled: parse_or("TOKEN_REFRESH_ENABLED", true)?,
            interval: Duration::from_secs(interval),
            threshold: Duration::from_secs(parse_or("TOKEN_REFRESH_THRESHOLD_SECS", 20 * 60)?),
        })
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::Missing(name))
}

fn parse_or<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(name) {
        None => Ok(default),
        Some(value) => value
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}
