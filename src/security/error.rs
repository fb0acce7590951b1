use std::fmt;

use crate::token::ParseError;

/// Why a request was not authenticated.
///
/// These are validation verdicts: the engine knows the token is not acceptable.
/// They are resolved into a negative outcome inside the authenticator and never
/// escalate further. Messages never contain token content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// No `Authorization` header, or it does not match the bearer pattern
    MissingBearer,
    /// Structurally invalid bearer string
    MalformedToken {
        /// Parser message
        reason: String,
    },
    /// Token carries no `iss` claim
    MissingIssuer,
    /// Issuer does not resolve to any trust anchor
    UntrustedIssuer {
        /// The issuer claim
        issuer: String,
        /// Why resolution failed
        reason: String,
    },
    /// `exp` has passed (beyond clock skew)
    ExpiredToken,
    /// `nbf` is in the future (beyond clock skew)
    NotYetValid,
    /// A cached identifier resolved to a different raw token
    TamperedToken,
    /// Cryptographic verification failed
    InvalidSignature,
    /// A claim the validator requires is absent
    MissingClaim {
        /// Claim name
        claim: String,
    },
    /// Header `alg` is not accepted, or does not fit the anchor's key
    UnsupportedAlgorithm {
        /// Algorithm name from the header
        alg: String,
    },
    /// No key in the anchor's key set matches the header `kid`
    UnknownSigningKey {
        /// Header `kid`, if any
        kid: Option<String>,
    },
    /// Token `aud` does not match the anchor's audience
    InvalidAudience,
    /// Token valid but has no scope claim at all
    NoScopesPresented,
    /// Token valid but none of its scopes satisfy the route
    InsufficientScope {
        /// Scopes required by the route
        required: Vec<String>,
        /// Scopes granted by the token
        granted: Vec<String>,
    },
}

impl Rejection {
    /// Short stable label, suitable for metrics and structured logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Rejection::MissingBearer => "missing_bearer",
            Rejection::MalformedToken { .. } => "malformed_token",
            Rejection::MissingIssuer => "missing_issuer",
            Rejection::UntrustedIssuer { .. } => "untrusted_issuer",
            Rejection::ExpiredToken => "expired_token",
            Rejection::NotYetValid => "not_yet_valid",
            Rejection::TamperedToken => "tampered_token",
            Rejection::InvalidSignature => "invalid_signature",
            Rejection::MissingClaim { .. } => "missing_claim",
            Rejection::UnsupportedAlgorithm { .. } => "unsupported_algorithm",
            Rejection::UnknownSigningKey { .. } => "unknown_signing_key",
            Rejection::InvalidAudience => "invalid_audience",
            Rejection::NoScopesPresented => "no_scopes_presented",
            Rejection::InsufficientScope { .. } => "insufficient_scope",
        }
    }

    /// `true` for verdicts reached after the token itself was accepted.
    #[must_use]
    pub fn is_authorization_failure(&self) -> bool {
        matches!(
            self,
            Rejection::NoScopesPresented | Rejection::InsufficientScope { .. }
        )
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::MissingBearer => write!(f, "no bearer token presented"),
            Rejection::MalformedToken { reason } => write!(f, "malformed token: {}", reason),
            Rejection::MissingIssuer => write!(f, "issuer is not found in the token"),
            Rejection::UntrustedIssuer { issuer, reason } => {
                write!(f, "issuer '{}' is not trusted: {}", issuer, reason)
            }
            Rejection::ExpiredToken => write!(f, "token expired"),
            Rejection::NotYetValid => write!(f, "token not yet valid"),
            Rejection::TamperedToken => {
                write!(f, "token identifier resolves to a different token")
            }
            Rejection::InvalidSignature => write!(f, "invalid signature"),
            Rejection::MissingClaim { claim } => write!(f, "missing required claim '{}'", claim),
            Rejection::UnsupportedAlgorithm { alg } => write!(f, "unsupported algorithm '{}'", alg),
            Rejection::UnknownSigningKey { kid } => match kid {
                Some(kid) => write!(f, "no signing key for kid '{}'", kid),
                None => write!(f, "no signing key for token without kid"),
            },
            Rejection::InvalidAudience => write!(f, "invalid audience"),
            Rejection::NoScopesPresented => write!(f, "no scopes presented in the token"),
            Rejection::InsufficientScope { required, granted } => write!(
                f,
                "insufficient scope (required any of: {:?}, granted: {:?})",
                required, granted
            ),
        }
    }
}

impl From<ParseError> for Rejection {
    fn from(e: ParseError) -> Self {
        Rejection::MalformedToken {
            reason: e.to_string(),
        }
    }
}

/// The engine could not reach a verdict.
///
/// Distinguishes "system degraded" from "request denied": callers should
/// surface these as 5xx-class failures, never as an invalid token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfrastructureError {
    /// JWKS endpoint unreachable, timed out or returned garbage
    JwksUnavailable {
        /// Endpoint URL
        url: String,
        /// Transport or decode error
        error: String,
    },
    /// Identity-provider manager failed to return the resident IDP
    IdentityProvider {
        /// Tenant domain that was looked up
        tenant_domain: String,
        /// Collaborator error
        error: String,
    },
    /// Trust material exists but cannot be turned into a verification key
    InvalidTrustAnchor {
        /// Issuer the anchor belongs to
        issuer: String,
        /// Decode error
        error: String,
    },
    /// Realm/user-store could not resolve the tenant id
    TenantResolution {
        /// Tenant domain that was looked up
        tenant_domain: String,
        /// Collaborator error
        error: String,
    },
}

impl fmt::Display for InfrastructureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InfrastructureError::JwksUnavailable { url, error } => {
                write!(f, "JWKS endpoint {} unavailable: {}", url, error)
            }
            InfrastructureError::IdentityProvider {
                tenant_domain,
                error,
            } => write!(
                f,
                "error while getting resident identity provider of '{}' tenant: {}",
                tenant_domain, error
            ),
            InfrastructureError::InvalidTrustAnchor { issuer, error } => {
                write!(f, "invalid trust anchor for issuer '{}': {}", issuer, error)
            }
            InfrastructureError::TenantResolution {
                tenant_domain,
                error,
            } => write!(
                f,
                "error while retrieving tenant id for tenant domain '{}': {}",
                tenant_domain, error
            ),
        }
    }
}

impl std::error::Error for InfrastructureError {}
