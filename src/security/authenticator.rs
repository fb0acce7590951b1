//! # Bearer Token Authenticator
//!
//! [`OAuthJwtAuthenticator`] drives one request through
//!
//! ```text
//! Received -> Parsed -> IssuerResolved -> CacheChecked -> {CacheHit | Verified}
//!          -> ScopeChecked -> ContextBound -> Authenticated
//! ```
//!
//! Any step may end in `Rejected`. There are no retries within a request.
//! Verdicts come back as [`AuthOutcome::Rejected`]; collaborator failures
//! come back as `Err(InfrastructureError)` so callers can tell a denied
//! request from a degraded system.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use brrtauth::security::{
//!     AuthRequest, InMemoryRealm, InMemoryRouteMetadata, IssuerMap, IssuerResolver,
//!     OAuthJwtAuthenticator,
//! };
//! use http::{HeaderMap, Method};
//!
//! let authenticator = OAuthJwtAuthenticator::builder(
//!     IssuerResolver::new(IssuerMap::new()),
//!     Arc::new(InMemoryRouteMetadata::new()),
//!     Arc::new(InMemoryRealm::new()),
//! )
//! .clock_skew_secs(60)
//! .build();
//!
//! let headers = HeaderMap::new();
//! let method = Method::GET;
//! let request = AuthRequest::new(&headers, &method, "/apis").api("/api/am/devportal", "/v3");
//! assert!(!authenticator.is_authenticated(&request));
//! ```

use http::header::AUTHORIZATION;
use http::{HeaderMap, Method};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::cache::{CacheLookup, ValidationCache};
use super::error::{InfrastructureError, Rejection};
use super::issuer::{IssuerResolver, ResolveError};
use super::scope::{RouteMetadataProvider, ScopeAuthorizer};
use super::tenant::{AuthContext, RealmService, TenantContextBinder};
use super::validation::SignatureValidator;
use crate::token::{MaskedToken, ParsedToken};

/// Default `Authorization` scheme pattern.
pub const DEFAULT_BEARER_PATTERN: &str = r"(?i)^bearer\s+";

static DEFAULT_BEARER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(DEFAULT_BEARER_PATTERN).expect("default bearer pattern should be valid")
});

/// Where a request is in the authentication flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Header not yet inspected
    Received,
    /// Token decoded
    Parsed,
    /// Validator found for the issuer
    IssuerResolved,
    /// Cache consulted
    CacheChecked,
    /// Valid result served from cache
    CacheHit,
    /// Signature and time claims verified
    Verified,
    /// Scopes authorized
    ScopeChecked,
    /// Tenant context built
    ContextBound,
    /// Done, request may proceed
    Authenticated,
    /// Done, request denied
    Rejected,
}

impl AuthState {
    /// Lower-case name for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            AuthState::Received => "received",
            AuthState::Parsed => "parsed",
            AuthState::IssuerResolved => "issuer_resolved",
            AuthState::CacheChecked => "cache_checked",
            AuthState::CacheHit => "cache_hit",
            AuthState::Verified => "verified",
            AuthState::ScopeChecked => "scope_checked",
            AuthState::ContextBound => "context_bound",
            AuthState::Authenticated => "authenticated",
            AuthState::Rejected => "rejected",
        }
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The parts of an inbound request the authenticator reads.
#[derive(Debug, Clone, Copy)]
pub struct AuthRequest<'a> {
    /// Request headers; only `Authorization` is read
    pub headers: &'a HeaderMap,
    /// Request method
    pub method: &'a Method,
    /// Resource path relative to `base_path` + `version`
    pub path: &'a str,
    /// API base path, e.g. `/api/am/devportal`
    pub base_path: &'a str,
    /// API version segment, e.g. `/v3`
    pub version: &'a str,
    /// Organization resolved by the gateway, if any
    pub organization: Option<&'a str>,
}

impl<'a> AuthRequest<'a> {
    /// Request for `method` on `path` with no API or organization set.
    pub fn new(headers: &'a HeaderMap, method: &'a Method, path: &'a str) -> Self {
        Self {
            headers,
            method,
            path,
            base_path: "",
            version: "",
            organization: None,
        }
    }

    /// Set the API the path belongs to.
    #[must_use]
    pub fn api(mut self, base_path: &'a str, version: &'a str) -> Self {
        self.base_path = base_path;
        self.version = version;
        self
    }

    /// Set the organization resolved by the gateway.
    #[must_use]
    pub fn organization(mut self, organization: &'a str) -> Self {
        self.organization = Some(organization);
        self
    }
}

/// Verdict for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Proceed with this identity
    Authenticated(AuthContext),
    /// Deny; no identity is published
    Rejected(Rejection),
}

impl AuthOutcome {
    /// `true` for [`AuthOutcome::Authenticated`].
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthOutcome::Authenticated(_))
    }

    /// Identity of an authenticated request.
    pub fn context(&self) -> Option<&AuthContext> {
        match self {
            AuthOutcome::Authenticated(ctx) => Some(ctx),
            AuthOutcome::Rejected(_) => None,
        }
    }

    /// Reason of a rejected request.
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            AuthOutcome::Authenticated(_) => None,
            AuthOutcome::Rejected(reason) => Some(reason),
        }
    }
}

/// Bearer JWT authenticator for a multi-tenant gateway.
///
/// Constructed once at startup and shared by reference across worker
/// threads. The validation cache is the only mutable shared state.
pub struct OAuthJwtAuthenticator {
    bearer_pattern: Regex,
    issuers: IssuerResolver,
    cache: Arc<ValidationCache>,
    validator: SignatureValidator,
    scopes: ScopeAuthorizer,
    routes: Arc<dyn RouteMetadataProvider>,
    tenants: TenantContextBinder,
}

/// Builder for [`OAuthJwtAuthenticator`].
pub struct AuthenticatorBuilder {
    issuers: IssuerResolver,
    routes: Arc<dyn RouteMetadataProvider>,
    realm: Arc<dyn RealmService>,
    bearer_pattern: Option<Regex>,
    clock_skew_secs: u64,
    token_cache_enabled: bool,
    cache: Option<Arc<ValidationCache>>,
    scope_delimiter: String,
    email_username_enabled: bool,
    super_tenant_domain: Option<String>,
}

impl AuthenticatorBuilder {
    /// `Authorization` scheme pattern; the token is what follows the match.
    pub fn bearer_pattern(mut self, pattern: Regex) -> Self {
        self.bearer_pattern = Some(pattern);
        self
    }

    /// Clock skew tolerance for `exp`/`nbf` and cached expiry.
    pub fn clock_skew_secs(mut self, secs: u64) -> Self {
        self.clock_skew_secs = secs;
        self
    }

    /// Enable or disable the validation cache.
    pub fn token_cache_enabled(mut self, enabled: bool) -> Self {
        self.token_cache_enabled = enabled;
        self
    }

    /// Use an externally owned cache (overrides `token_cache_enabled`).
    pub fn cache(mut self, cache: Arc<ValidationCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Delimiter of the `scope` claim.
    pub fn scope_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.scope_delimiter = delimiter.into();
        self
    }

    /// Treat super tenant usernames as email addresses.
    pub fn email_username_enabled(mut self, enabled: bool) -> Self {
        self.email_username_enabled = enabled;
        self
    }

    /// Override the super tenant domain.
    pub fn super_tenant_domain(mut self, domain: impl Into<String>) -> Self {
        self.super_tenant_domain = Some(domain.into());
        self
    }

    /// Finish.
    pub fn build(self) -> OAuthJwtAuthenticator {
        let mut tenants = TenantContextBinder::new(self.realm)
            .email_username_enabled(self.email_username_enabled);
        if let Some(domain) = self.super_tenant_domain {
            tenants = tenants.super_tenant_domain(domain);
        }
        OAuthJwtAuthenticator {
            bearer_pattern: self
                .bearer_pattern
                .unwrap_or_else(|| DEFAULT_BEARER.clone()),
            issuers: self.issuers,
            cache: self.cache.unwrap_or_else(|| {
                Arc::new(ValidationCache::new(
                    self.token_cache_enabled,
                    self.clock_skew_secs,
                ))
            }),
            validator: SignatureValidator::new(self.clock_skew_secs),
            scopes: ScopeAuthorizer::new(self.scope_delimiter),
            routes: self.routes,
            tenants,
        }
    }
}

impl OAuthJwtAuthenticator {
    /// Start building an authenticator from its three collaborators.
    pub fn builder(
        issuers: IssuerResolver,
        routes: Arc<dyn RouteMetadataProvider>,
        realm: Arc<dyn RealmService>,
    ) -> AuthenticatorBuilder {
        AuthenticatorBuilder {
            issuers,
            routes,
            realm,
            bearer_pattern: None,
            clock_skew_secs: 300,
            token_cache_enabled: true,
            cache: None,
            scope_delimiter: " ".to_string(),
            email_username_enabled: false,
            super_tenant_domain: None,
        }
    }

    /// Issuer resolver, e.g. to hot-swap static issuers.
    pub fn issuers(&self) -> &IssuerResolver {
        &self.issuers
    }

    /// Validation cache, for administration and stats.
    pub fn cache(&self) -> &ValidationCache {
        &self.cache
    }

    /// Signature validator, for its verification counter.
    pub fn signature_validator(&self) -> &SignatureValidator {
        &self.validator
    }

    /// Boolean view of [`authenticate`](Self::authenticate). Infrastructure
    /// failures count as not authenticated.
    pub fn is_authenticated(&self, request: &AuthRequest<'_>) -> bool {
        matches!(self.authenticate(request), Ok(AuthOutcome::Authenticated(_)))
    }

    /// Authenticate and authorize one request.
    pub fn authenticate(
        &self,
        request: &AuthRequest<'_>,
    ) -> Result<AuthOutcome, InfrastructureError> {
        let raw = match self.extract_bearer(request.headers) {
            Some(raw) => raw,
            None => {
                debug!("no bearer token in Authorization header");
                return Ok(AuthOutcome::Rejected(Rejection::MissingBearer));
            }
        };
        let masked = MaskedToken::of(raw);

        let token = match ParsedToken::parse(raw) {
            Ok(token) => token,
            Err(e) => {
                error!(token = %masked, error = %e, "Invalid JWT token");
                return Ok(reject(&masked, AuthState::Received, e.into()));
            }
        };
        debug!(token = %masked, state = %AuthState::Parsed, "starting JWT token validation");

        // Trust anchors are looked up in the subject's organization
        let organization = token
            .subject()
            .map(|sub| self.tenants.tenant_domain_of(sub))
            .or_else(|| request.organization.map(str::to_string));
        let validator = match self.issuers.resolve(token.issuer(), organization.as_deref()) {
            Ok(validator) => validator,
            Err(ResolveError::Rejected(reason)) => {
                return Ok(reject(&masked, AuthState::Parsed, reason));
            }
            Err(ResolveError::Infrastructure(e)) => {
                error!(token = %masked, error = %e, "issuer resolution failed");
                return Err(e);
            }
        };
        debug!(token = %masked, state = %AuthState::IssuerResolved, issuer = validator.issuer(), kind = validator.kind(), "issuer resolved");

        let jti = token.token_identifier();
        let (result, state) = match self.cache.lookup(jti, raw) {
            CacheLookup::Hit(result) => (result, AuthState::CacheHit),
            CacheLookup::Demoted(result) | CacheLookup::NegativeHit(result) => {
                (result, AuthState::CacheChecked)
            }
            CacheLookup::Miss => {
                let result = match self.validator.validate(&token, &validator) {
                    Ok(result) => result,
                    Err(e) => {
                        error!(token = %masked, error = %e, "token verification could not complete");
                        return Err(e);
                    }
                };
                (self.cache.store(jti, result), AuthState::Verified)
            }
        };
        if !result.is_valid() {
            let reason = result
                .reason()
                .cloned()
                .unwrap_or(Rejection::InvalidSignature);
            return Ok(reject(&masked, state, reason));
        }
        debug!(token = %masked, state = %state, "token is valid");

        let granted = match self.scopes.granted_scopes(token.claims().scope.as_deref()) {
            Ok(granted) => granted,
            Err(reason) => return Ok(reject(&masked, state, reason)),
        };
        let required = self.routes.required_scopes(
            request.base_path,
            request.version,
            request.method,
            request.path,
        );
        let granted = match required {
            Some(required) if self.scopes.authorize(&granted, &required) => granted,
            Some(required) => {
                let reason = Rejection::InsufficientScope {
                    required: required.into_iter().collect(),
                    granted,
                };
                return Ok(reject(&masked, state, reason));
            }
            None => {
                warn!(
                    token = %masked,
                    method = %request.method,
                    path = request.path,
                    "no URI template matches the request"
                );
                let reason = Rejection::InsufficientScope {
                    required: Vec::new(),
                    granted,
                };
                return Ok(reject(&masked, state, reason));
            }
        };

        let subject = match token.subject() {
            Some(subject) => subject,
            None => {
                let reason = Rejection::MissingClaim {
                    claim: "sub".to_string(),
                };
                return Ok(reject(&masked, AuthState::ScopeChecked, reason));
            }
        };
        let context = match self.tenants.bind(
            subject,
            granted,
            request.organization,
            token.claims().azp.as_deref(),
        ) {
            Ok(context) => context,
            Err(e) => {
                error!(token = %masked, error = %e, "tenant context binding failed");
                return Err(e);
            }
        };
        debug!(
            token = %masked,
            state = %AuthState::Authenticated,
            tenant_domain = %context.tenant_domain,
            "request authenticated"
        );
        Ok(AuthOutcome::Authenticated(context))
    }

    fn extract_bearer<'h>(&self, headers: &'h HeaderMap) -> Option<&'h str> {
        let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
        let scheme = self.bearer_pattern.find(value)?;
        let token = value[scheme.end()..].trim();
        (!token.is_empty()).then_some(token)
    }
}

impl fmt::Debug for OAuthJwtAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthJwtAuthenticator")
            .field("bearer_pattern", &self.bearer_pattern.as_str())
            .field("issuers", &self.issuers)
            .field("cache", &self.cache.stats())
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

fn reject(masked: &MaskedToken, state: AuthState, reason: Rejection) -> AuthOutcome {
    if reason.is_authorization_failure() {
        warn!(token = %masked, state = %state, reason = reason.label(), "scope validation failed");
    } else {
        error!(token = %masked, state = %state, reason = reason.label(), detail = %reason, "JWT token validation failed");
    }
    AuthOutcome::Rejected(reason)
}
