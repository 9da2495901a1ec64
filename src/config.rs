//! Service configuration from the environment.

use rust_decimal::Decimal;
use std::str::FromStr;
use thiserror::Error;

use crate::domain::pricing::PricingPolicy;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has an invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageBackend { Postgres, Memory }

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayConfig {
    pub store_id: String,
    pub store_password: String,
    pub sandbox: bool,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub port: u16,
    pub storage: StorageBackend,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub nats_url: Option<String>,
    /// Public base URL of this service; gateway callbacks point here.
    pub site_url: String,
    /// Where shoppers land after the gateway hands them back.
    pub frontend_url: String,
    pub pricing: PricingPolicy,
    /// `None` when SSLCommerz credentials are absent.
    pub gateway: Option<GatewayConfig>,
    pub payment_window: chrono::Duration,
    pub session_ttl: chrono::Duration,
    pub cors_origins: Vec<String>,
    pub seed_sample_data: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from any variable source; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(lookup);

        let storage = match env.get("STORAGE_BACKEND").as_deref() {
            None | Some("postgres") => StorageBackend::Postgres,
            Some("memory") => StorageBackend::Memory,
            Some(other) => return Err(ConfigError::Invalid { name: "STORAGE_BACKEND", value: other.to_string() }),
        };
        let database_url = env.get("DATABASE_URL");
        if storage == StorageBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let port: u16 = env.parse("PORT", 8083)?;
        let default_pricing = PricingPolicy::default();
        let pricing = PricingPolicy {
            currency: env.get("STORE_CURRENCY").map(|c| c.to_uppercase()).unwrap_or(default_pricing.currency),
            shipping_flat_fee: env.parse("SHIPPING_FLAT_FEE", default_pricing.shipping_flat_fee)?,
            free_shipping_threshold: match env.get("FREE_SHIPPING_THRESHOLD").as_deref() {
                None => default_pricing.free_shipping_threshold,
                Some("none" | "off") => None,
                Some(raw) => Some(parse_value("FREE_SHIPPING_THRESHOLD", raw)?),
            },
            tax_rate: env.parse("TAX_RATE", Decimal::ZERO)?,
        };
        if pricing.shipping_flat_fee.is_sign_negative() || pricing.tax_rate.is_sign_negative() {
            return Err(ConfigError::Invalid { name: "SHIPPING_FLAT_FEE/TAX_RATE", value: "negative".into() });
        }

        let gateway = match (env.get("SSLCOMMERZ_STORE_ID"), env.get("SSLCOMMERZ_STORE_PASSWORD")) {
            (Some(store_id), Some(store_password)) => {
                Some(GatewayConfig { store_id, store_password, sandbox: env.flag("SSLCOMMERZ_SANDBOX", true)? })
            }
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing("SSLCOMMERZ_STORE_PASSWORD")),
            (None, Some(_)) => return Err(ConfigError::Missing("SSLCOMMERZ_STORE_ID")),
        };

        let site_url = env.get("SITE_URL").unwrap_or_else(|| format!("http://localhost:{port}"));
        let frontend_url = env.get("FRONTEND_URL").unwrap_or_else(|| site_url.clone());

        Ok(Self {
            port,
            storage,
            database_url,
            database_max_connections: env.parse("DATABASE_MAX_CONNECTIONS", 10)?,
            nats_url: env.get("NATS_URL"),
            site_url: site_url.trim_end_matches('/').to_string(),
            frontend_url: frontend_url.trim_end_matches('/').to_string(),
            pricing,
            gateway,
            payment_window: chrono::Duration::minutes(env.parse("PAYMENT_WINDOW_MINUTES", 30)?),
            session_ttl: chrono::Duration::hours(env.parse("SESSION_TTL_HOURS", 336)?),
            cors_origins: env
                .get("CORS_ORIGINS")
                .map(|raw| raw.split(',').map(str::trim).filter(|o| !o.is_empty()).map(String::from).collect())
                .unwrap_or_default(),
            seed_sample_data: env.flag("SEED_SAMPLE_DATA", false)?,
        })
    }

    /// Settings for tests and local tooling: memory storage, no gateway.
    pub fn local() -> Self {
        Self {
            port: 8083,
            storage: StorageBackend::Memory,
            database_url: None,
            database_max_connections: 10,
            nats_url: None,
            site_url: "http://localhost:8083".into(),
            frontend_url: "http://localhost:8083".into(),
            pricing: PricingPolicy::default(),
            gateway: None,
            payment_window: chrono::Duration::minutes(30),
            session_ttl: chrono::Duration::hours(336),
            cors_origins: vec![],
            seed_sample_data: false,
        }
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, name: &'static str, default: T) -> Result<T, ConfigError> {
        match self.get(name) {
            Some(raw) => parse_value(name, &raw),
            None => Ok(default),
        }
    }

    fn flag(&self, name: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.get(name).map(|v| v.to_ascii_lowercase()).as_deref() {
            None => Ok(default),
            Some("1" | "true" | "yes" | "on") => Ok(true),
            Some("0" | "false" | "no" | "off") => Ok(false),
            Some(other) => Err(ConfigError::Invalid { name, value: other.to_string() }),
        }
    }
}

fn parse_value<T: FromStr>(name: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::Invalid { name, value: raw.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AppConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let config = load(&[("DATABASE_URL", "postgres://localhost/shop")]).unwrap();
        assert_eq!(config.port, 8083);
        assert_eq!(config.storage, StorageBackend::Postgres);
        assert_eq!(config.pricing, PricingPolicy::default());
        assert_eq!(config.payment_window, chrono::Duration::minutes(30));
        assert_eq!(config.site_url, "http://localhost:8083");
        assert!(config.gateway.is_none());
        assert!(!config.seed_sample_data);
    }

    #[test]
    fn postgres_needs_database_url() {
        assert_eq!(load(&[]).unwrap_err(), ConfigError::Missing("DATABASE_URL"));
        assert!(load(&[("STORAGE_BACKEND", "memory")]).is_ok());
    }

    #[test]
    fn rejects_malformed_numbers() {
        let err = load(&[("STORAGE_BACKEND", "memory"), ("PORT", "eighty")]).unwrap_err();
        assert_eq!(err, ConfigError::Invalid { name: "PORT", value: "eighty".into() });
        assert!(load(&[("STORAGE_BACKEND", "memory"), ("SEED_SAMPLE_DATA", "maybe")]).is_err());
    }

    #[test]
    fn gateway_credentials_come_in_pairs() {
        let err = load(&[("STORAGE_BACKEND", "memory"), ("SSLCOMMERZ_STORE_ID", "shop")]).unwrap_err();
        assert_eq!(err, ConfigError::Missing("SSLCOMMERZ_STORE_PASSWORD"));

        let config = load(&[
            ("STORAGE_BACKEND", "memory"),
            ("SSLCOMMERZ_STORE_ID", "shop"),
            ("SSLCOMMERZ_STORE_PASSWORD", "secret"),
            ("SSLCOMMERZ_SANDBOX", "false"),
        ])
        .unwrap();
        assert_eq!(config.gateway, Some(GatewayConfig { store_id: "shop".into(), store_password: "secret".into(), sandbox: false }));
    }

    #[test]
    fn pricing_and_origins() {
        let config = load(&[
            ("STORAGE_BACKEND", "memory"),
            ("FREE_SHIPPING_THRESHOLD", "none"),
            ("TAX_RATE", "0.05"),
            ("CORS_ORIGINS", "https://a.example, https://b.example,"),
            ("SITE_URL", "https://api.example/"),
        ])
        .unwrap();
        assert_eq!(config.pricing.free_shipping_threshold, None);
        assert_eq!(config.pricing.tax_rate, Decimal::new(5, 2));
        assert_eq!(config.cors_origins, vec!["https://a.example", "https://b.example"]);
        assert_eq!(config.site_url, "https://api.example");
        assert_eq!(config.frontend_url, "https://api.example");
    }
}
