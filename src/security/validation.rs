//! Signature and time-claim verification.
//!
//! [`SignatureValidator::validate`] turns a parsed token plus a [`Validator`]
//! into an immutable [`ValidationResult`]. Invalid tokens are a result with
//! `valid == false`, never an error; `Err` is reserved for infrastructure
//! failures such as an unreachable JWKS endpoint.

use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use super::anchor::Validator;
use super::jwks::KeyLookup;
use super::error::{InfrastructureError, Rejection};
use crate::token::{Claims, ParsedToken};

/// Algorithms accepted in token headers. Anything else is rejected before
/// key lookup.
pub const SUPPORTED_ALGORITHMS: &[jsonwebtoken::Algorithm] = &[
    jsonwebtoken::Algorithm::HS256,
    jsonwebtoken::Algorithm::HS384,
    jsonwebtoken::Algorithm::HS512,
    jsonwebtoken::Algorithm::RS256,
    jsonwebtoken::Algorithm::RS384,
    jsonwebtoken::Algorithm::RS512,
    jsonwebtoken::Algorithm::PS256,
    jsonwebtoken::Algorithm::PS384,
    jsonwebtoken::Algorithm::PS512,
    jsonwebtoken::Algorithm::ES256,
    jsonwebtoken::Algorithm::ES384,
];

/// Outcome of verifying one token. Never mutated after construction;
/// demotion produces a new value.
#[derive(Clone)]
pub struct ValidationResult {
    valid: bool,
    reason: Option<Rejection>,
    expiry: Option<i64>,
    raw_payload: Arc<str>,
    claims: Arc<Claims>,
    cacheable: bool,
}

impl ValidationResult {
    /// Successful verification of `token`.
    #[must_use]
    pub fn valid(token: &ParsedToken) -> Self {
        Self {
            valid: true,
            reason: None,
            expiry: token.claims().exp,
            raw_payload: Arc::from(token.raw()),
            claims: Arc::new(token.claims().clone()),
            cacheable: true,
        }
    }

    /// Failed verification of `token`.
    #[must_use]
    pub fn invalid(token: &ParsedToken, reason: Rejection) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
            expiry: token.claims().exp,
            raw_payload: Arc::from(token.raw()),
            claims: Arc::new(token.claims().clone()),
            cacheable: true,
        }
    }

    /// Failed verification whose verdict may change with time, such as a
    /// token that is not valid yet. Never cached.
    #[must_use]
    pub fn provisional(token: &ParsedToken, reason: Rejection) -> Self {
        Self {
            cacheable: false,
            ..Self::invalid(token, reason)
        }
    }

    /// Invalid copy of this result, keeping payload, expiry and claims.
    #[must_use]
    pub fn demoted(&self, reason: Rejection) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
            expiry: self.expiry,
            raw_payload: Arc::clone(&self.raw_payload),
            claims: Arc::clone(&self.claims),
            cacheable: true,
        }
    }

    /// Whether the token passed every check.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Whether the verdict may be remembered for later requests.
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    /// Why the token was rejected, for invalid results.
    #[must_use]
    pub fn reason(&self) -> Option<&Rejection> {
        self.reason.as_ref()
    }

    /// Token expiry, seconds since the epoch.
    #[must_use]
    pub fn expiry(&self) -> Option<i64> {
        self.expiry
    }

    /// The raw token this result was computed for.
    #[must_use]
    pub fn raw_payload(&self) -> &str {
        &self.raw_payload
    }

    /// Claims of the verified token.
    #[must_use]
    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    /// `true` when `expiry + clock_skew` lies before `now`.
    ///
    /// A result without expiry never expires by time (the validator refuses
    /// to produce valid results for such tokens).
    #[must_use]
    pub fn is_expired(&self, now: i64, clock_skew_secs: u64) -> bool {
        match self.expiry {
            Some(exp) => exp.saturating_add(clock_skew_secs as i64) < now,
            None => false,
        }
    }
}

impl fmt::Debug for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationResult")
            .field("valid", &self.valid)
            .field("reason", &self.reason)
            .field("expiry", &self.expiry)
            .field("cacheable", &self.cacheable)
            .field("claims", &self.claims)
            .finish_non_exhaustive()
    }
}

/// Current time in seconds since the epoch.
pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

enum Verdict {
    Accepted,
    Rejected(Rejection),
    /// Rejected for now; the same token may pass later.
    Deferred(Rejection),
}

/// Cryptographic verifier. Stateless apart from an invocation counter.
#[derive(Debug, Default)]
pub struct SignatureValidator {
    clock_skew_secs: u64,
    verifications: AtomicU64,
}

impl SignatureValidator {
    /// Create a validator tolerating `clock_skew_secs` on `exp` and `nbf`.
    #[must_use]
    pub fn new(clock_skew_secs: u64) -> Self {
        Self {
            clock_skew_secs,
            verifications: AtomicU64::new(0),
        }
    }

    /// Configured clock skew tolerance.
    #[must_use]
    pub fn clock_skew_secs(&self) -> u64 {
        self.clock_skew_secs
    }

    /// Number of tokens this validator has been asked to verify.
    #[must_use]
    pub fn verifications(&self) -> u64 {
        self.verifications.load(Ordering::Relaxed)
    }

    /// Verify signature, issuer, audience and time claims of `token`.
    pub fn validate(
        &self,
        token: &ParsedToken,
        validator: &Validator,
    ) -> Result<ValidationResult, InfrastructureError> {
        self.verifications.fetch_add(1, Ordering::Relaxed);
        let (reason, cacheable) = match self.check(token, validator)? {
            Verdict::Accepted => return Ok(ValidationResult::valid(token)),
            Verdict::Rejected(reason) => (reason, true),
            Verdict::Deferred(reason) => (reason, false),
        };
        debug!(
            token = %token.masked(),
            issuer = validator.issuer(),
            reason = reason.label(),
            cacheable,
            "token verification failed"
        );
        if cacheable {
            Ok(ValidationResult::invalid(token, reason))
        } else {
            Ok(ValidationResult::provisional(token, reason))
        }
    }

    fn check(
        &self,
        token: &ParsedToken,
        validator: &Validator,
    ) -> Result<Verdict, InfrastructureError> {
        let alg = token.header().alg;
        if !SUPPORTED_ALGORITHMS.contains(&alg) {
            return Ok(Verdict::Rejected(Rejection::UnsupportedAlgorithm {
                alg: format!("{:?}", alg),
            }));
        }

        let key = match validator {
            Validator::Certificate { key, .. } => key.clone(),
            Validator::Jwks { keys, .. } => {
                let kid = token.header().kid.as_deref();
                let unknown = || Rejection::UnknownSigningKey {
                    kid: kid.map(str::to_string),
                };
                match keys.key_for(kid) {
                    Ok(KeyLookup::Found(key)) => key,
                    Ok(KeyLookup::Missing) => return Ok(Verdict::Rejected(unknown())),
                    // The key may be published by the next allowed refresh
                    Ok(KeyLookup::RefreshSuppressed) => {
                        return Ok(Verdict::Deferred(unknown()))
                    }
                    Err(e) => {
                        return Err(InfrastructureError::JwksUnavailable {
                            url: keys.url().to_string(),
                            error: e.0,
                        })
                    }
                }
            }
        };

        let mut validation = jsonwebtoken::Validation::new(alg);
        validation.leeway = self.clock_skew_secs;
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["exp"]);
        validation.set_issuer(&[validator.issuer()]);
        match validator.audience() {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }

        match jsonwebtoken::decode::<Value>(token.raw(), &key, &validation) {
            Ok(_) => Ok(Verdict::Accepted),
            Err(e) => {
                use jsonwebtoken::errors::ErrorKind;
                let reason = match e.kind() {
                    ErrorKind::ExpiredSignature => Rejection::ExpiredToken,
                    ErrorKind::ImmatureSignature => {
                        return Ok(Verdict::Deferred(Rejection::NotYetValid))
                    }
                    ErrorKind::InvalidSignature => Rejection::InvalidSignature,
                    ErrorKind::InvalidIssuer => Rejection::UntrustedIssuer {
                        issuer: token.issuer().unwrap_or_default().to_string(),
                        reason: format!("validator expects '{}'", validator.issuer()),
                    },
                    ErrorKind::InvalidAudience => Rejection::InvalidAudience,
                    ErrorKind::MissingRequiredClaim(claim) => Rejection::MissingClaim {
                        claim: claim.clone(),
                    },
                    ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
                        Rejection::UnsupportedAlgorithm {
                            alg: format!("{:?}", alg),
                        }
                    }
                    // Key material that cannot verify anything is still a
                    // failed signature from the token's point of view
                    _ => Rejection::InvalidSignature,
                };
                Ok(Verdict::Rejected(reason))
            }
        }
    }
}
