//! Trust anchors and the validators built from them.
//!
//! A [`TrustAnchor`] says how tokens from one issuer are verified: against a
//! static X.509 certificate, or against a JWKS endpoint whose keys rotate.
//! A [`Validator`] is the ready-to-use form: decoded key or live key set.

use base64::Engine as _;
use jsonwebtoken::DecodingKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use x509_parser::oid_registry::{OID_KEY_TYPE_EC_PUBLIC_KEY, OID_PKCS1_RSAENCRYPTION};

use super::error::InfrastructureError;
use super::jwks::{JwksKeySet, JwksSettings};

/// Key material for one issuer. Exactly one kind per anchor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustMaterial {
    /// Base64 DER or PEM encoded X.509 certificate
    Certificate(String),
    /// JWKS endpoint URL
    JwksUrl(String),
}

/// How to verify tokens from one issuer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustAnchor {
    /// Expected `iss` claim
    pub issuer: String,
    /// Certificate or JWKS endpoint
    pub material: TrustMaterial,
    /// Expected `aud` claim; `None` disables the audience check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
}

impl TrustAnchor {
    /// Anchor backed by a static certificate.
    pub fn certificate(issuer: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            material: TrustMaterial::Certificate(content.into()),
            audience: None,
        }
    }

    /// Anchor backed by a JWKS endpoint.
    pub fn jwks(issuer: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            material: TrustMaterial::JwksUrl(url.into()),
            audience: None,
        }
    }

    /// Require an `aud` claim.
    pub fn audience(mut self, aud: impl Into<String>) -> Self {
        self.audience = Some(aud.into());
        self
    }
}

/// Ready-to-use verifier for one issuer.
pub enum Validator {
    /// Static public key taken from an X.509 certificate
    Certificate {
        /// Expected `iss`
        issuer: String,
        /// Expected `aud`
        audience: Option<String>,
        /// Public key from the certificate's SubjectPublicKeyInfo
        key: DecodingKey,
    },
    /// Keys published at a JWKS endpoint, refreshed on demand
    Jwks {
        /// Expected `iss`
        issuer: String,
        /// Expected `aud`
        audience: Option<String>,
        /// Shared, refreshable key set
        keys: Arc<JwksKeySet>,
    },
}

impl Validator {
    /// Build a validator from an anchor. Each JWKS anchor gets its own key set.
    pub fn from_anchor(
        anchor: &TrustAnchor,
        settings: JwksSettings,
    ) -> Result<Self, InfrastructureError> {
        let validator = match &anchor.material {
            TrustMaterial::Certificate(content) => Self::certificate(&anchor.issuer, content)?,
            TrustMaterial::JwksUrl(url) => {
                let keys = JwksKeySet::new(url, settings).map_err(|error| {
                    InfrastructureError::InvalidTrustAnchor {
                        issuer: anchor.issuer.clone(),
                        error,
                    }
                })?;
                Self::jwks(&anchor.issuer, Arc::new(keys))
            }
        };
        Ok(match &anchor.audience {
            Some(aud) => validator.with_audience(aud.clone()),
            None => validator,
        })
    }

    /// Validator for a certificate given as PEM or bare base64 DER.
    pub fn certificate(issuer: &str, content: &str) -> Result<Self, InfrastructureError> {
        let key = decoding_key_from_certificate(content).map_err(|error| {
            InfrastructureError::InvalidTrustAnchor {
                issuer: issuer.to_string(),
                error,
            }
        })?;
        Ok(Validator::Certificate {
            issuer: issuer.to_string(),
            audience: None,
            key,
        })
    }

    /// Validator over an existing (possibly shared) key set.
    pub fn jwks(issuer: &str, keys: Arc<JwksKeySet>) -> Self {
        Validator::Jwks {
            issuer: issuer.to_string(),
            audience: None,
            keys,
        }
    }

    /// Require an `aud` claim.
    #[must_use]
    pub fn with_audience(self, aud: String) -> Self {
        match self {
            Validator::Certificate { issuer, key, .. } => Validator::Certificate {
                issuer,
                audience: Some(aud),
                key,
            },
            Validator::Jwks { issuer, keys, .. } => Validator::Jwks {
                issuer,
                audience: Some(aud),
                keys,
            },
        }
    }

    /// Issuer this validator accepts.
    #[must_use]
    pub fn issuer(&self) -> &str {
        match self {
            Validator::Certificate { issuer, .. } | Validator::Jwks { issuer, .. } => issuer,
        }
    }

    /// Audience this validator requires, if any.
    #[must_use]
    pub fn audience(&self) -> Option<&str> {
        match self {
            Validator::Certificate { audience, .. } | Validator::Jwks { audience, .. } => {
                audience.as_deref()
            }
        }
    }

    /// `certificate` or `jwks`, for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Validator::Certificate { .. } => "certificate",
            Validator::Jwks { .. } => "jwks",
        }
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Validator::Certificate {
                issuer, audience, ..
            } => f
                .debug_struct("Validator::Certificate")
                .field("issuer", issuer)
                .field("audience", audience)
                .finish_non_exhaustive(),
            Validator::Jwks {
                issuer,
                audience,
                keys,
            } => f
                .debug_struct("Validator::Jwks")
                .field("issuer", issuer)
                .field("audience", audience)
                .field("url", &keys.url())
                .finish(),
        }
    }
}

/// Extract the verification key from certificate content.
///
/// Accepts PEM (armor lines are dropped) or bare base64 DER, with arbitrary
/// whitespace. RSA and EC public keys are supported.
pub(crate) fn decoding_key_from_certificate(content: &str) -> Result<DecodingKey, String> {
    let body: String = content
        .lines()
        .filter(|line| !line.trim_start().starts_with("-----"))
        .flat_map(|line| line.chars())
        .filter(|c| !c.is_whitespace())
        .collect();
    if body.is_empty() {
        return Err("certificate content is empty".to_string());
    }
    let der = base64::engine::general_purpose::STANDARD
        .decode(body.as_bytes())
        .map_err(|e| format!("certificate is not valid base64: {}", e))?;
    let (_, cert) = x509_parser::parse_x509_certificate(&der)
        .map_err(|e| format!("error while converting into X509Certificate: {}", e))?;

    let spki = cert.public_key();
    let public_key: &[u8] = spki.subject_public_key.data.as_ref();
    if spki.algorithm.algorithm == OID_PKCS1_RSAENCRYPTION {
        Ok(DecodingKey::from_rsa_der(public_key))
    } else if spki.algorithm.algorithm == OID_KEY_TYPE_EC_PUBLIC_KEY {
        Ok(DecodingKey::from_ec_der(public_key))
    } else {
        Err(format!(
            "unsupported certificate key algorithm {:?}",
            spki.algorithm.algorithm
        ))
    }
}
