//! # Security Module
//!
//! Bearer JWT authentication and scope authorization for a multi-tenant gateway.
//!
//! ## Overview
//!
//! The pieces, leaves first:
//!
//! - [`TrustAnchor`] / [`Validator`] - how tokens from one issuer are verified,
//!   a static certificate or a refreshable [`JwksKeySet`]
//! - [`IssuerResolver`] - maps a token's `iss` (and the caller's organization)
//!   to a [`Validator`]
//! - [`SignatureValidator`] - signature and time-claim checks producing an
//!   immutable [`ValidationResult`]
//! - [`ValidationCache`] - valid / invalid tiers keyed by token identifier
//! - [`ScopeAuthorizer`] - granted scopes against the [`UriTemplate`]s of a route
//! - [`TenantContextBinder`] - derives the [`AuthContext`] from the subject
//! - [`OAuthJwtAuthenticator`] - runs all of the above for one request
//!
//! ## Collaborators
//!
//! The engine owns no identity data. It consumes narrow traits, each with an
//! in-memory implementation for tests and small deployments:
//!
//! | Trait | In-memory |
//! |---|---|
//! | [`KeyManagerRegistry`] | [`InMemoryKeyManagers`] |
//! | [`IdentityProviderManager`] | [`InMemoryIdentityProviders`] |
//! | [`RealmService`] | [`InMemoryRealm`] |
//! | [`RouteMetadataProvider`] | [`InMemoryRouteMetadata`] |
//!
//! ## Errors
//!
//! [`Rejection`] is a verdict ("this token is not acceptable") and never leaves
//! the authenticator except inside [`AuthOutcome::Rejected`].
//! [`InfrastructureError`] means no verdict could be reached and is returned
//! as `Err`.

mod anchor;
mod authenticator;
mod cache;
mod error;
mod issuer;
mod jwks;
mod scope;
mod tenant;
mod validation;

pub use anchor::{TrustAnchor, TrustMaterial, Validator};
pub use authenticator::{
    AuthOutcome, AuthRequest, AuthState, AuthenticatorBuilder, OAuthJwtAuthenticator,
    DEFAULT_BEARER_PATTERN,
};
pub use cache::{CacheLookup, CacheStats, ValidationCache};
pub use error::{InfrastructureError, Rejection};
pub use issuer::{
    FederatedAuthenticatorConfig, IdentityProvider, IdentityProviderManager,
    InMemoryIdentityProviders, InMemoryKeyManagers, IssuerMap, IssuerResolver,
    KeyManagerRegistry, Property, ResolveError, JWKS_URI, OIDC_AUTHENTICATOR,
    OIDC_IDP_ENTITY_ID,
};
pub use jwks::{JwksFetchError, JwksKeySet, JwksSettings, KeyLookup};
pub use scope::{InMemoryRouteMetadata, RouteMetadataProvider, ScopeAuthorizer, UriTemplate};
pub use tenant::{
    AuthContext, InMemoryRealm, RealmService, TenantContextBinder, DEFAULT_SUPER_TENANT_DOMAIN,
    SUPER_TENANT_ID,
};
pub use validation::{SignatureValidator, ValidationResult, SUPPORTED_ALGORITHMS};
