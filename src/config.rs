//! # Configuration Module
//!
//! [`AuthConfig`] gathers every deployment knob of the authenticator. It is
//! read from a YAML, TOML or JSON file and then overridden by environment
//! variables.
//!
//! ## Environment Variables
//!
//! | Variable | Field | Default |
//! |---|---|---|
//! | `BRRTAUTH_TOKEN_CACHE` | `token_cache_enabled` | `true` |
//! | `BRRTAUTH_CLOCK_SKEW_SECS` | `clock_skew_secs` | `300` |
//! | `BRRTAUTH_EMAIL_USERNAME` | `email_username_enabled` | `false` |
//! | `BRRTAUTH_JWKS_TIMEOUT_MS` | `jwks.timeout_ms` | `2000` |
//!
//! Flags accept `true`/`false`, `on`/`off` and `1`/`0`. Unparseable values
//! are ignored with a warning.
//!
//! ## Example
//!
//! ```yaml
//! clock_skew_secs: 60
//! token_issuers:
//!   "https://idp.example/oauth2/token":
//!     jwks_url: "https://idp.example/oauth2/jwks"
//!     audience: "gateway"
//!   "https://legacy.example/token":
//!     certificate: |
//!       -----BEGIN CERTIFICATE-----
//!       MIIB...
//!       -----END CERTIFICATE-----
//! ```

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::security::{
    AuthenticatorBuilder, IssuerMap, IssuerResolver, JwksSettings, OAuthJwtAuthenticator,
    RealmService, RouteMetadataProvider, TrustAnchor, Validator, DEFAULT_BEARER_PATTERN,
    DEFAULT_SUPER_TENANT_DOMAIN,
};

/// JWKS fetch and caching settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JwksConfig {
    /// HTTP timeout per fetch
    pub timeout_ms: u64,
    /// How long fetched keys are trusted
    pub cache_ttl_secs: u64,
    /// Minimum gap between forced refreshes
    pub min_refresh_interval_secs: u64,
}

impl Default for JwksConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2000,
            cache_ttl_secs: 300,
            min_refresh_interval_secs: 10,
        }
    }
}

/// Key material for one statically trusted issuer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenIssuerConfig {
    /// PEM or base64 DER certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    /// JWKS endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_url: Option<String>,
    /// Required `aud`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
}

impl TokenIssuerConfig {
    /// Trust anchor for `issuer`. Exactly one of certificate and JWKS URL
    /// must be set.
    pub fn anchor(&self, issuer: &str) -> Result<TrustAnchor> {
        let anchor = match (&self.certificate, &self.jwks_url) {
            (Some(cert), None) => TrustAnchor::certificate(issuer, cert.as_str()),
            (None, Some(url)) => TrustAnchor::jwks(issuer, url.as_str()),
            (Some(_), Some(_)) => {
                bail!("token issuer '{}' sets both certificate and jwks_url", issuer)
            }
            (None, None) => bail!(
                "token issuer '{}' needs either a certificate or a jwks_url",
                issuer
            ),
        };
        Ok(match &self.audience {
            Some(aud) => anchor.audience(aud.as_str()),
            None => anchor,
        })
    }
}

/// Authenticator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Cache validation results per token identifier
    pub token_cache_enabled: bool,
    /// Tolerance on `exp`/`nbf`, seconds
    pub clock_skew_secs: u64,
    /// Separator of the `scope` claim
    pub scope_delimiter: String,
    /// `Authorization` scheme regex; the token follows the match
    pub bearer_pattern: String,
    /// Super tenant usernames are email addresses
    pub email_username_enabled: bool,
    /// Domain of the super tenant
    pub super_tenant_domain: String,
    /// JWKS behaviour
    pub jwks: JwksConfig,
    /// Static issuer allow-list; empty means dynamic resolution
    pub token_issuers: BTreeMap<String, TokenIssuerConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_cache_enabled: true,
            clock_skew_secs: 300,
            scope_delimiter: " ".to_string(),
            bearer_pattern: DEFAULT_BEARER_PATTERN.to_string(),
            email_username_enabled: false,
            super_tenant_domain: DEFAULT_SUPER_TENANT_DOMAIN.to_string(),
            jwks: JwksConfig::default(),
            token_issuers: BTreeMap::new(),
        }
    }
}

impl AuthConfig {
    /// Defaults overridden by the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Read `path` (format chosen by extension), apply environment overrides
    /// and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read auth config: {}", path.display()))?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let mut config: AuthConfig = match extension.as_str() {
            "yaml" | "yml" => serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse auth config: {}", path.display()))?,
            "toml" => toml::from_str(&content)
                .with_context(|| format!("Failed to parse auth config: {}", path.display()))?,
            "json" => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse auth config: {}", path.display()))?,
            other => bail!(
                "unsupported auth config format '{}' ({}), expected yaml, toml or json",
                other,
                path.display()
            ),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply `BRRTAUTH_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| env::var(key).ok());
    }

    pub(crate) fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("BRRTAUTH_TOKEN_CACHE") {
            match parse_flag(&v) {
                Some(flag) => self.token_cache_enabled = flag,
                None => warn!(value = %v, "ignoring invalid BRRTAUTH_TOKEN_CACHE"),
            }
        }
        if let Some(v) = lookup("BRRTAUTH_CLOCK_SKEW_SECS") {
            match v.trim().parse() {
                Ok(secs) => self.clock_skew_secs = secs,
                Err(_) => warn!(value = %v, "ignoring invalid BRRTAUTH_CLOCK_SKEW_SECS"),
            }
        }
        if let Some(v) = lookup("BRRTAUTH_EMAIL_USERNAME") {
            match parse_flag(&v) {
                Some(flag) => self.email_username_enabled = flag,
                None => warn!(value = %v, "ignoring invalid BRRTAUTH_EMAIL_USERNAME"),
            }
        }
        if let Some(v) = lookup("BRRTAUTH_JWKS_TIMEOUT_MS") {
            match v.trim().parse() {
                Ok(ms) => self.jwks.timeout_ms = ms,
                Err(_) => warn!(value = %v, "ignoring invalid BRRTAUTH_JWKS_TIMEOUT_MS"),
            }
        }
    }

    /// Check the bearer pattern and every token issuer.
    pub fn validate(&self) -> Result<()> {
        self.bearer_regex()?;
        if self.jwks.timeout_ms == 0 {
            bail!("jwks.timeout_ms must be greater than zero");
        }
        self.trust_anchors()?;
        Ok(())
    }

    /// Compiled `bearer_pattern`.
    pub fn bearer_regex(&self) -> Result<Regex> {
        Regex::new(&self.bearer_pattern)
            .with_context(|| format!("invalid bearer_pattern '{}'", self.bearer_pattern))
    }

    /// Settings for JWKS key sets.
    pub fn jwks_settings(&self) -> JwksSettings {
        JwksSettings {
            timeout: Duration::from_millis(self.jwks.timeout_ms),
            cache_ttl: Duration::from_secs(self.jwks.cache_ttl_secs),
            min_refresh_interval: Duration::from_secs(self.jwks.min_refresh_interval_secs),
        }
    }

    /// Trust anchors of the static token issuers.
    pub fn trust_anchors(&self) -> Result<Vec<TrustAnchor>> {
        self.token_issuers
            .iter()
            .map(|(issuer, cfg)| cfg.anchor(issuer))
            .collect()
    }

    /// Static issuer map for the [`IssuerResolver`].
    pub fn issuer_validators(&self) -> Result<IssuerMap> {
        let settings = self.jwks_settings();
        let mut validators = IssuerMap::new();
        for anchor in self.trust_anchors()? {
            let validator = Validator::from_anchor(&anchor, settings)
                .with_context(|| format!("Failed to load token issuer '{}'", anchor.issuer))?;
            validators.insert(anchor.issuer.clone(), Arc::new(validator));
        }
        Ok(validators)
    }

    /// Resolver over the static token issuers, with no collaborators yet.
    pub fn issuer_resolver(&self) -> Result<IssuerResolver> {
        Ok(IssuerResolver::new(self.issuer_validators()?).with_jwks_settings(self.jwks_settings()))
    }

    /// Authenticator builder carrying every setting of this config.
    pub fn authenticator_builder(
        &self,
        issuers: IssuerResolver,
        routes: Arc<dyn RouteMetadataProvider>,
        realm: Arc<dyn RealmService>,
    ) -> Result<AuthenticatorBuilder> {
        Ok(OAuthJwtAuthenticator::builder(issuers, routes, realm)
            .bearer_pattern(self.bearer_regex()?)
            .clock_skew_secs(self.clock_skew_secs)
            .token_cache_enabled(self.token_cache_enabled)
            .scope_delimiter(self.scope_delimiter.as_str())
            .email_username_enabled(self.email_username_enabled)
            .super_tenant_domain(self.super_tenant_domain.as_str()))
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "on" | "1" | "yes" => Some(true),
        "false" | "off" | "0" | "no" => Some(false),
        _ => None,
    }
}
