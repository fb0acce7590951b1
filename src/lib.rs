//! # brrtauth
//!
//! **brrtauth** authenticates and authorizes REST API calls carrying OAuth2
//! bearer JWTs on a multi-tenant gateway.
//!
//! ## Overview
//!
//! For every request the gateway hands over the headers, method, resource
//! path and the API the path belongs to. brrtauth then:
//!
//! 1. extracts the bearer token from the `Authorization` header
//! 2. decodes it without verifying anything ([`token::ParsedToken`])
//! 3. decides which trust anchor may vouch for its `iss`
//! 4. verifies signature and time claims, consulting a two-tier cache first
//! 5. checks the token's scopes against the scopes the route requires
//! 6. derives the tenant identity of the subject
//!
//! The result is an [`AuthOutcome`]: an [`AuthContext`] to forward to the
//! backend, or the [`Rejection`] that stopped the request.
//!
//! ## Architecture
//!
//! - **[`token`]** - unverified JWT decoding and log-safe masking
//! - **[`security`]** - the engine: issuer resolution, signature validation,
//!   validation cache, scope authorization, tenant binding and the
//!   [`OAuthJwtAuthenticator`] that runs them
//! - **[`config`]** - [`AuthConfig`] from YAML/TOML/JSON plus environment
//! - **[`logging`]** - `tracing` subscriber setup for the binary
//! - **[`cli`]** - the `brrtauth` command: `inspect` and `verify`
//!
//! ## Request Flow
//!
//! ```mermaid
//! sequenceDiagram
//!     participant GW as Gateway
//!     participant Auth as OAuthJwtAuthenticator
//!     participant Res as IssuerResolver
//!     participant Cache as ValidationCache
//!     participant Sig as SignatureValidator
//!     participant Scope as ScopeAuthorizer
//!     participant Tenant as TenantContextBinder
//!
//!     GW->>Auth: authenticate(request)
//!     Auth->>Auth: extract bearer, parse
//!     Auth->>Res: resolve(organization, iss)
//!     Res-->>Auth: Validator
//!     Auth->>Cache: lookup(jti, raw)
//!     alt miss
//!         Auth->>Sig: validate(token, validator)
//!         Sig-->>Auth: ValidationResult
//!         Auth->>Cache: store(jti, result)
//!     end
//!     Auth->>Scope: check(scope claim, route scopes)
//!     Auth->>Tenant: bind(subject, scopes)
//!     Auth-->>GW: Authenticated(AuthContext) | Rejected(reason)
//! ```
//!
//! ## Errors
//!
//! A [`Rejection`] is a verdict and travels inside [`AuthOutcome::Rejected`].
//! An [`InfrastructureError`] (JWKS endpoint down, identity provider or tenant
//! store failing) is returned as `Err`, so the gateway can answer with a 5xx
//! instead of a 401.
//!
//! ## Logging
//!
//! Every stage emits `tracing` events. Tokens only ever appear as
//! [`token::MaskedToken`] (`jwt#` plus a SHA-256 prefix).

pub mod cli;
pub mod config;
pub mod logging;
pub mod security;
pub mod token;

pub use config::AuthConfig;
pub use security::{
    AuthContext, AuthOutcome, AuthRequest, InfrastructureError, OAuthJwtAuthenticator, Rejection,
};
pub use token::{ParsedToken, ParseError};
