//! Issuer to validator resolution.
//!
//! Order, first match wins:
//!
//! 1. The static issuer map. When it is non-empty it is an allow-list: an
//!    issuer outside it is untrusted and nothing else is consulted.
//! 2. The per-organization key-manager registry.
//! 3. The organization's resident identity provider, whose OIDC entity id
//!    must equal the token issuer. Its certificate wins over its JWKS URI.

use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use super::anchor::Validator;
use super::error::{InfrastructureError, Rejection};
use super::jwks::{JwksKeySet, JwksSettings};

/// Name of the OIDC federated authenticator on a resident identity provider.
pub const OIDC_AUTHENTICATOR: &str = "OpenIDConnectAuthenticator";
/// Authenticator property carrying the issuer (entity id).
pub const OIDC_IDP_ENTITY_ID: &str = "IdPEntityId";
/// Identity provider property carrying the JWKS endpoint.
pub const JWKS_URI: &str = "jwksUri";

/// Static issuer map, issuer string to ready validator.
pub type IssuerMap = HashMap<String, Arc<Validator>>;

/// Why resolution did not produce a validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// Verdict: the issuer is missing or not trusted
    Rejected(Rejection),
    /// A collaborator failed; no verdict was reached
    Infrastructure(InfrastructureError),
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveError::Rejected(r) => write!(f, "{}", r),
            ResolveError::Infrastructure(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ResolveError {}

impl From<Rejection> for ResolveError {
    fn from(r: Rejection) -> Self {
        ResolveError::Rejected(r)
    }
}

impl From<InfrastructureError> for ResolveError {
    fn from(e: InfrastructureError) -> Self {
        ResolveError::Infrastructure(e)
    }
}

/// Per-organization registry of key managers, each possibly owning a validator.
pub trait KeyManagerRegistry: Send + Sync {
    /// Validator of the key manager in `organization` that issues `issuer`.
    fn lookup_by_issuer(&self, organization: &str, issuer: &str) -> Option<Arc<Validator>>;
}

/// Source of tenants' resident identity providers.
pub trait IdentityProviderManager: Send + Sync {
    /// The resident identity provider of `tenant_domain`.
    ///
    /// `Err` is a store failure, not "no such provider".
    fn resident_identity_provider(&self, tenant_domain: &str) -> Result<IdentityProvider, String>;
}

/// Name/value pair on an identity provider or authenticator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    /// Property name
    pub name: String,
    /// Property value
    pub value: String,
}

impl Property {
    /// Shorthand constructor.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Configuration of one federated authenticator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FederatedAuthenticatorConfig {
    /// Authenticator name, e.g. [`OIDC_AUTHENTICATOR`]
    pub name: String,
    /// Authenticator properties
    pub properties: Vec<Property>,
}

/// A tenant's identity provider as far as token trust is concerned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityProvider {
    /// Display name, for logs
    pub name: String,
    /// PEM or base64 DER certificate
    pub certificate: Option<String>,
    /// Provider-level properties, e.g. [`JWKS_URI`]
    pub properties: Vec<Property>,
    /// Federated authenticators
    pub federated_authenticators: Vec<FederatedAuthenticatorConfig>,
}

impl IdentityProvider {
    /// Value of a provider-level property.
    pub fn property(&self, name: &str) -> Option<&str> {
        find_property(&self.properties, name)
    }

    /// Issuer advertised by the OIDC authenticator.
    pub fn oidc_entity_id(&self) -> Option<&str> {
        self.federated_authenticators
            .iter()
            .find(|a| a.name == OIDC_AUTHENTICATOR)
            .and_then(|a| find_property(&a.properties, OIDC_IDP_ENTITY_ID))
    }

    /// Configured JWKS endpoint.
    pub fn jwks_uri(&self) -> Option<&str> {
        self.property(JWKS_URI)
    }
}

fn find_property<'a>(properties: &'a [Property], name: &str) -> Option<&'a str> {
    properties
        .iter()
        .find(|p| p.name == name)
        .map(|p| p.value.as_str())
        .filter(|v| !v.is_empty())
}

/// Resolves token issuers to validators.
pub struct IssuerResolver {
    static_issuers: ArcSwap<IssuerMap>,
    key_managers: Option<Arc<dyn KeyManagerRegistry>>,
    identity_providers: Option<Arc<dyn IdentityProviderManager>>,
    jwks_settings: JwksSettings,
    // Shared per URL so key rotation state outlives a single request
    resident_key_sets: DashMap<String, Arc<JwksKeySet>>,
}

impl IssuerResolver {
    /// Resolver over a static map (possibly empty) and no collaborators.
    pub fn new(static_issuers: IssuerMap) -> Self {
        Self {
            static_issuers: ArcSwap::from_pointee(static_issuers),
            key_managers: None,
            identity_providers: None,
            jwks_settings: JwksSettings::default(),
            resident_key_sets: DashMap::new(),
        }
    }

    /// Consult `registry` when the static map is empty.
    pub fn with_key_managers(mut self, registry: Arc<dyn KeyManagerRegistry>) -> Self {
        self.key_managers = Some(registry);
        self
    }

    /// Fall back to resident identity providers from `manager`.
    pub fn with_identity_providers(mut self, manager: Arc<dyn IdentityProviderManager>) -> Self {
        self.identity_providers = Some(manager);
        self
    }

    /// Settings for JWKS key sets built from resident identity providers.
    pub fn with_jwks_settings(mut self, settings: JwksSettings) -> Self {
        self.jwks_settings = settings;
        self
    }

    /// Atomically replace the static issuer map.
    pub fn replace_static_issuers(&self, issuers: IssuerMap) {
        info!(issuers = issuers.len(), "replacing static token issuers");
        self.static_issuers.store(Arc::new(issuers));
    }

    /// Issuers currently in the static map.
    pub fn static_issuers(&self) -> Vec<String> {
        self.static_issuers.load().keys().cloned().collect()
    }

    /// Find the validator for `issuer` on behalf of `organization`.
    pub fn resolve(
        &self,
        issuer: Option<&str>,
        organization: Option<&str>,
    ) -> Result<Arc<Validator>, ResolveError> {
        let issuer = match issuer {
            Some(iss) if !iss.is_empty() => iss,
            _ => return Err(Rejection::MissingIssuer.into()),
        };

        let static_issuers = self.static_issuers.load();
        if !static_issuers.is_empty() {
            return match static_issuers.get(issuer) {
                Some(validator) => {
                    debug!(issuer, kind = validator.kind(), "issuer resolved from static map");
                    Ok(Arc::clone(validator))
                }
                None => Err(untrusted(
                    issuer,
                    format!(
                        "issuer does not match any configured token issuer ({})",
                        static_issuers.len()
                    ),
                )),
            };
        }

        let organization = match organization {
            Some(org) if !org.is_empty() => org,
            _ => {
                return Err(untrusted(
                    issuer,
                    "no organization to look up a trust anchor in",
                ))
            }
        };

        if let Some(registry) = &self.key_managers {
            if let Some(validator) = registry.lookup_by_issuer(organization, issuer) {
                debug!(issuer, organization, "issuer resolved from key manager");
                return Ok(validator);
            }
        }

        self.resolve_resident(issuer, organization)
    }

    fn resolve_resident(
        &self,
        issuer: &str,
        organization: &str,
    ) -> Result<Arc<Validator>, ResolveError> {
        let manager = match &self.identity_providers {
            Some(manager) => manager,
            None => return Err(untrusted(issuer, "no trust anchor configured")),
        };
        let idp = manager
            .resident_identity_provider(organization)
            .map_err(|error| InfrastructureError::IdentityProvider {
                tenant_domain: organization.to_string(),
                error,
            })?;

        if idp.oidc_entity_id() != Some(issuer) {
            return Err(untrusted(
                issuer,
                format!(
                    "resident identity provider cannot be found for the organization: {}",
                    organization
                ),
            ));
        }

        if let Some(certificate) = idp.certificate.as_deref().filter(|c| !c.trim().is_empty()) {
            debug!(issuer, idp = %idp.name, "using resident identity provider certificate");
            return Ok(Arc::new(Validator::certificate(issuer, certificate)?));
        }

        match idp.jwks_uri() {
            Some(url) => {
                debug!(issuer, idp = %idp.name, jwks_uri = url, "using resident identity provider JWKS");
                let keys = self.resident_key_set(issuer, url)?;
                Ok(Arc::new(Validator::jwks(issuer, keys)))
            }
            None => {
                warn!(issuer, idp = %idp.name, "resident identity provider has no key material");
                Err(untrusted(
                    issuer,
                    "resident identity provider has neither certificate nor JWKS endpoint",
                ))
            }
        }
    }

    fn resident_key_set(
        &self,
        issuer: &str,
        url: &str,
    ) -> Result<Arc<JwksKeySet>, InfrastructureError> {
        let entry = self
            .resident_key_sets
            .entry(url.to_string())
            .or_try_insert_with(|| JwksKeySet::new(url, self.jwks_settings).map(Arc::new))
            .map_err(|error| InfrastructureError::InvalidTrustAnchor {
                issuer: issuer.to_string(),
                error,
            })?;
        Ok(Arc::clone(entry.value()))
    }
}

impl fmt::Debug for IssuerResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuerResolver")
            .field("static_issuers", &self.static_issuers())
            .field("key_managers", &self.key_managers.is_some())
            .field("identity_providers", &self.identity_providers.is_some())
            .field("resident_key_sets", &self.resident_key_sets.len())
            .finish()
    }
}

fn untrusted(issuer: &str, reason: impl Into<String>) -> ResolveError {
    ResolveError::Rejected(Rejection::UntrustedIssuer {
        issuer: issuer.to_string(),
        reason: reason.into(),
    })
}

/// Key-manager registry held in memory, keyed by organization then issuer.
#[derive(Default)]
pub struct InMemoryKeyManagers {
    validators: RwLock<HashMap<(String, String), Arc<Validator>>>,
}

impl InMemoryKeyManagers {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `validator` for `issuer` in `organization`.
    pub fn register(&self, organization: &str, validator: Validator) {
        if let Ok(mut validators) = self.validators.write() {
            validators.insert(
                (organization.to_string(), validator.issuer().to_string()),
                Arc::new(validator),
            );
        }
    }
}

impl KeyManagerRegistry for InMemoryKeyManagers {
    fn lookup_by_issuer(&self, organization: &str, issuer: &str) -> Option<Arc<Validator>> {
        let validators = self.validators.read().ok()?;
        validators
            .get(&(organization.to_string(), issuer.to_string()))
            .cloned()
    }
}

/// Identity-provider manager held in memory, keyed by tenant domain.
#[derive(Default)]
pub struct InMemoryIdentityProviders {
    providers: RwLock<HashMap<String, IdentityProvider>>,
}

impl InMemoryIdentityProviders {
    /// Empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the resident identity provider of `tenant_domain`.
    pub fn insert(&self, tenant_domain: &str, idp: IdentityProvider) {
        if let Ok(mut providers) = self.providers.write() {
            providers.insert(tenant_domain.to_string(), idp);
        }
    }
}

impl IdentityProviderManager for InMemoryIdentityProviders {
    fn resident_identity_provider(&self, tenant_domain: &str) -> Result<IdentityProvider, String> {
        let providers = self
            .providers
            .read()
            .map_err(|_| "identity provider store lock poisoned".to_string())?;
        providers
            .get(tenant_domain)
            .cloned()
            .ok_or_else(|| format!("no resident identity provider for tenant '{}'", tenant_domain))
    }
}
