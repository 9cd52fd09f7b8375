//! Service configuration for gatepass.
//!
//! One TOML file plus `GATEPASS_`-prefixed environment overlays,
//! merged through figment and validated on load, then translated into
//! the core types the service runs on: device endpoint, payment
//! gateway, product policies. Secrets live as plain strings in the
//! schema so the defaults layer can serialize; they are wrapped in
//! `SecretString` at the translation seam and redacted from `Debug`.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use gatepass_core::{
    BinderConfig, ChannelConfig, ConektaGateway, CredentialKind, DeviceEndpoint,
    MercadoPagoGateway, PaymentGateway, PendingHandling, ProductPolicy, SettlementPolicy,
    SignaturePolicy, UserManagerConfig,
};

/// File looked up in the working directory when no `--config` path is
/// given.
pub const DEFAULT_CONFIG_FILE: &str = "gatepass.toml";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.to_owned(),
        reason: reason.into(),
    }
}

// ── Schema ──────────────────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Product catalog; `[[product]]` tables in TOML.
    #[serde(default)]
    pub product: Vec<ProductConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Bind address for the HTTP surface.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Concurrent device operations allowed at once.
    #[serde(default = "default_concurrency")]
    pub device_concurrency: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            device_concurrency: default_concurrency(),
        }
    }
}

/// The appliance the service provisions onto.
#[derive(Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub host: String,

    /// API port; 8729 switches the channel to TLS.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_username")]
    pub username: String,

    /// API password. Env: `GATEPASS_DEVICE__SECRET`.
    #[serde(default)]
    pub secret: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            username: default_username(),
            secret: String::new(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayProvider {
    #[default]
    Conekta,
    MercadoPago,
}

impl GatewayProvider {
    fn as_str(self) -> &'static str {
        match self {
            Self::Conekta => "conekta",
            Self::MercadoPago => "mercado_pago",
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub provider: GatewayProvider,

    /// Overrides the provider's shipped pending handling.
    pub pending: Option<PendingHandling>,

    /// Overrides whether pending outcomes disclose credentials.
    pub disclose_pending_credentials: Option<bool>,

    pub conekta: Option<ConektaConfig>,
    pub mercado_pago: Option<MercadoPagoConfig>,
}

impl GatewayConfig {
    /// Shipped provider policy with the config's overrides applied.
    fn overridden(&self, base: SettlementPolicy) -> SettlementPolicy {
        SettlementPolicy {
            pending: self.pending.unwrap_or(base.pending),
            disclose_pending_credentials: self
                .disclose_pending_credentials
                .unwrap_or(base.disclose_pending_credentials),
        }
    }
}

#[derive(Clone, Deserialize, Serialize)]
pub struct ConektaConfig {
    pub private_key: String,

    #[serde(default = "default_conekta_url")]
    pub base_url: String,
}

impl fmt::Debug for ConektaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConektaConfig")
            .field("private_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[derive(Clone, Deserialize, Serialize)]
pub struct MercadoPagoConfig {
    pub access_token: String,

    /// Enables webhook signature verification when set.
    pub webhook_secret: Option<String>,

    /// Passed to the gateway so it knows where to send notifications.
    pub notification_url: Option<String>,

    #[serde(default = "default_mercado_pago_url")]
    pub base_url: String,

    #[serde(default)]
    pub signature_policy: SignaturePolicy,
}

impl fmt::Debug for MercadoPagoConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MercadoPagoConfig")
            .field("access_token", &"<redacted>")
            .field("webhook_secret", &self.webhook_secret.as_ref().map(|_| "<redacted>"))
            .field("notification_url", &self.notification_url)
            .field("base_url", &self.base_url)
            .field("signature_policy", &self.signature_policy)
            .finish()
    }
}

/// One sellable product.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProductConfig {
    pub id: String,
    pub name: String,
    /// Hotspot user profile provisioned for this product.
    pub profile: String,
    pub amount: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    /// Normalized leniently; unknown spellings mean user-and-secret.
    #[serde(default = "default_credential_kind")]
    pub credential_kind: String,
}

impl ProductConfig {
    pub fn credential_kind(&self) -> CredentialKind {
        CredentialKind::normalize(&self.credential_kind)
    }

    pub fn policy(&self) -> ProductPolicy {
        ProductPolicy {
            profile_name: self.profile.clone(),
            amount: self.amount,
            currency: self.currency.clone(),
            credential_kind: self.credential_kind(),
            description: self.name.clone(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".into()
}
fn default_concurrency() -> usize {
    4
}
fn default_port() -> u16 {
    8728
}
fn default_username() -> String {
    "api".into()
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_conekta_url() -> String {
    "https://api.conekta.io".into()
}
fn default_mercado_pago_url() -> String {
    "https://api.mercadopago.com".into()
}
fn default_currency() -> String {
    "MXN".into()
}
fn default_credential_kind() -> String {
    "user_and_secret".into()
}

// ── Loading ─────────────────────────────────────────────────────────

/// Load and validate configuration: defaults, then the TOML file (the
/// given path or [`DEFAULT_CONFIG_FILE`]), then `GATEPASS_` env vars
/// with `__` as the section separator.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let file = path.map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), Path::to_path_buf);
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(&file))
        .merge(Env::prefixed("GATEPASS_").split("__"));

    let config: Config = figment.extract()?;
    config.validate()?;
    Ok(config)
}

// ── Validation ──────────────────────────────────────────────────────

fn require(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(invalid(field, "must be set"));
    }
    Ok(())
}

fn parse_url(field: &str, value: &str) -> Result<Url, ConfigError> {
    value
        .parse()
        .map_err(|_| invalid(field, format!("invalid URL: {value}")))
}

impl Config {
    /// Everything the service would otherwise discover at first
    /// request, checked up front.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;
        if self.service.device_concurrency == 0 {
            return Err(invalid("service.device_concurrency", "must be at least 1"));
        }

        require("device.host", &self.device.host)?;
        require("device.username", &self.device.username)?;
        require("device.secret", &self.device.secret)?;
        if self.device.port == 0 {
            return Err(invalid("device.port", "must be non-zero"));
        }

        match self.gateway.provider {
            GatewayProvider::Conekta => {
                let Some(conekta) = &self.gateway.conekta else {
                    return Err(section_required("gateway.conekta", self.gateway.provider));
                };
                require("gateway.conekta.private_key", &conekta.private_key)?;
                parse_url("gateway.conekta.base_url", &conekta.base_url)?;
            }
            GatewayProvider::MercadoPago => {
                let Some(mp) = &self.gateway.mercado_pago else {
                    return Err(section_required(
                        "gateway.mercado_pago",
                        self.gateway.provider,
                    ));
                };
                require("gateway.mercado_pago.access_token", &mp.access_token)?;
                parse_url("gateway.mercado_pago.base_url", &mp.base_url)?;
                if let Some(url) = &mp.notification_url {
                    parse_url("gateway.mercado_pago.notification_url", url)?;
                }
            }
        }

        if self.product.is_empty() {
            return Err(invalid("product", "at least one [[product]] is required"));
        }
        let mut seen: Vec<&str> = Vec::new();
        for product in &self.product {
            require("product.id", &product.id)?;
            require("product.profile", &product.profile)?;
            require("product.currency", &product.currency)?;
            if !(product.amount.is_finite() && product.amount > 0.0) {
                return Err(invalid(
                    "product.amount",
                    format!("'{}' must be a positive amount", product.id),
                ));
            }
            if seen.contains(&product.id.as_str()) {
                return Err(invalid(
                    "product.id",
                    format!("duplicate product id '{}'", product.id),
                ));
            }
            seen.push(&product.id);
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.service.listen.parse().map_err(|_| {
            invalid(
                "service.listen",
                format!("not a socket address: {}", self.service.listen),
            )
        })
    }

    pub fn product(&self, id: &str) -> Option<&ProductConfig> {
        self.product.iter().find(|product| product.id == id)
    }

    // ── Translation into core types ──────────────────────────────────

    /// The device endpoint, with the secret wrapped at this seam.
    pub fn device_endpoint(&self) -> DeviceEndpoint {
        DeviceEndpoint::new(
            self.device.host.clone(),
            self.device.port,
            self.device.username.clone(),
            SecretString::from(self.device.secret.clone()),
        )
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig::with_connect_timeout(Duration::from_secs(self.device.connect_timeout_secs))
    }

    pub fn user_manager_config(&self) -> UserManagerConfig {
        UserManagerConfig {
            channel: self.channel_config(),
            ..UserManagerConfig::default()
        }
    }

    pub fn binder_config(&self) -> BinderConfig {
        BinderConfig {
            channel: self.channel_config(),
            ..BinderConfig::default()
        }
    }

    /// Build the configured gateway with policy overrides applied.
    pub fn build_gateway(&self) -> Result<Arc<dyn PaymentGateway>, ConfigError> {
        match self.gateway.provider {
            GatewayProvider::Conekta => {
                let Some(conekta) = &self.gateway.conekta else {
                    return Err(section_required("gateway.conekta", self.gateway.provider));
                };
                let base_url = parse_url("gateway.conekta.base_url", &conekta.base_url)?;
                let gateway = ConektaGateway::new(
                    SecretString::from(conekta.private_key.clone()),
                    base_url,
                );
                let policy = self.gateway.overridden(gateway.settlement_policy());
                Ok(Arc::new(gateway.with_policy(policy)))
            }
            GatewayProvider::MercadoPago => {
                let Some(mp) = &self.gateway.mercado_pago else {
                    return Err(section_required(
                        "gateway.mercado_pago",
                        self.gateway.provider,
                    ));
                };
                let base_url = parse_url("gateway.mercado_pago.base_url", &mp.base_url)?;
                let mut gateway = MercadoPagoGateway::new(
                    SecretString::from(mp.access_token.clone()),
                    base_url,
                );
                if let Some(url) = &mp.notification_url {
                    gateway = gateway.with_notification_url(url.clone());
                }
                let policy = self.gateway.overridden(gateway.settlement_policy());
                Ok(Arc::new(gateway.with_policy(policy)))
            }
        }
    }

    /// Webhook signing secret, when the configured gateway has one.
    pub fn webhook_secret(&self) -> Option<&str> {
        self.gateway
            .mercado_pago
            .as_ref()
            .and_then(|mp| mp.webhook_secret.as_deref())
    }

    pub fn signature_policy(&self) -> SignaturePolicy {
        self.gateway
            .mercado_pago
            .as_ref()
            .map_or(SignaturePolicy::default(), |mp| mp.signature_policy)
    }
}

fn section_required(field: &str, provider: GatewayProvider) -> ConfigError {
    invalid(
        field,
        format!("section required when provider = \"{}\"", provider.as_str()),
    )
}
