//! # Token Parsing Module
//!
//! Decodes a raw bearer string into a [`ParsedToken`] without verifying its
//! signature. Verification is always a separate, explicit step performed by a
//! [`Validator`](crate::security::Validator).
//!
//! ## Format
//!
//! A well-formed bearer token has exactly three dot-separated segments:
//!
//! ```text
//! base64url(header) . base64url(claims) . base64url(signature)
//! ```
//!
//! Anything with a different dot count is rejected before any decoding or
//! cryptographic work happens.
//!
//! ## Logging
//!
//! Raw tokens are credentials. Never format one; log a [`MaskedToken`] instead:
//!
//! ```rust
//! use brrtauth::token::MaskedToken;
//!
//! let masked = MaskedToken::of("aaa.bbb.ccc");
//! assert!(masked.to_string().starts_with("jwt#"));
//! assert!(!masked.to_string().contains("bbb"));
//! ```

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::error::Category;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

/// Error returned when a bearer string is not a structurally valid JWT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The token does not contain exactly two `.` separators.
    SegmentCount {
        /// Number of dots found
        dots: usize,
    },
    /// A segment is not valid base64url.
    Encoding {
        /// Which segment failed (`header`, `claims` or `signature`)
        segment: &'static str,
    },
    /// A segment decoded but is not the expected JSON structure.
    Structure {
        /// Which segment failed
        segment: &'static str,
        /// Decoder error category (`syntax`, `data`, `eof` or `io`)
        category: &'static str,
        /// Line of the failure within the decoded segment
        line: usize,
        /// Column of the failure within the decoded segment
        column: usize,
    },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::SegmentCount { dots } => write!(
                f,
                "expected token format <header.payload.signature>, found {} separators",
                dots
            ),
            ParseError::Encoding { segment } => {
                write!(f, "token {} segment is not valid base64url", segment)
            }
            ParseError::Structure {
                segment,
                category,
                line,
                column,
            } => write!(
                f,
                "token {} segment is not valid JSON ({} error at line {} column {})",
                segment, category, line, column
            ),
        }
    }
}

impl std::error::Error for ParseError {}

/// Registered and commonly used claims of a bearer token.
///
/// Unknown claims are preserved in [`Claims::extra`] so downstream handlers can
/// read provider-specific values (e.g. `org_id`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// `iss` - the issuing trust authority
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// `sub` - the end user, optionally tenant-qualified (`alice@acme.com`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// `jti` - token identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    /// `scope` - delimiter separated granted scopes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// `azp` - authorized party (OAuth2 client / consumer key)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azp: Option<String>,
    /// `exp` - expiry, seconds since the epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    /// `nbf` - not before, seconds since the epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    /// Every other claim, including `aud`
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A decoded but unverified bearer token.
///
/// Owns the raw string it was parsed from so the signature validator and the
/// tamper check in the validation cache can compare against it. The `Debug`
/// implementation never prints the raw token.
#[derive(Clone)]
pub struct ParsedToken {
    raw: String,
    header: jsonwebtoken::Header,
    claims: Claims,
    signature: String,
}

impl ParsedToken {
    /// Parse a raw bearer string.
    ///
    /// Fails fast with [`ParseError::SegmentCount`] when the dot count is not
    /// exactly two; nothing is decoded in that case.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let dots = raw.bytes().filter(|b| *b == b'.').count();
        if dots != 2 {
            return Err(ParseError::SegmentCount { dots });
        }

        let mut parts = raw.splitn(3, '.');
        let (header_b64, claims_b64, signature) = match (parts.next(), parts.next(), parts.next())
        {
            (Some(h), Some(c), Some(s)) => (h, c, s),
            _ => return Err(ParseError::SegmentCount { dots }),
        };

        let header: jsonwebtoken::Header = decode_segment(header_b64, "header")?;
        let claims: Claims = decode_segment(claims_b64, "claims")?;

        if signature.is_empty()
            || base64::engine::general_purpose::URL_SAFE_NO_PAD
                .decode(signature)
                .is_err()
        {
            return Err(ParseError::Encoding {
                segment: "signature",
            });
        }

        Ok(Self {
            raw: raw.to_string(),
            header,
            claims,
            signature: signature.to_string(),
        })
    }

    /// The exact string this token was parsed from.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// JOSE header (`alg`, `kid`, ...).
    #[must_use]
    pub fn header(&self) -> &jsonwebtoken::Header {
        &self.header
    }

    /// Decoded claim set.
    #[must_use]
    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    /// Encoded signature segment.
    #[must_use]
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Issuer claim, if present and non-empty.
    #[must_use]
    pub fn issuer(&self) -> Option<&str> {
        self.claims.iss.as_deref().filter(|s| !s.is_empty())
    }

    /// Subject claim, if present and non-empty.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.claims.sub.as_deref().filter(|s| !s.is_empty())
    }

    /// Cache key for this token: the `jti` claim, or the signature segment
    /// when no identifier was issued.
    #[must_use]
    pub fn token_identifier(&self) -> &str {
        match self.claims.jti.as_deref() {
            Some(jti) if !jti.is_empty() => jti,
            _ => &self.signature,
        }
    }

    /// Non-sensitive representation for logs.
    #[must_use]
    pub fn masked(&self) -> MaskedToken {
        MaskedToken::of(&self.raw)
    }
}

impl fmt::Debug for ParsedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParsedToken")
            .field("token", &self.masked())
            .field("alg", &self.header.alg)
            .field("kid", &self.header.kid)
            .field("claims", &self.claims)
            .finish()
    }
}

fn decode_segment<T: serde::de::DeserializeOwned>(
    segment: &str,
    name: &'static str,
) -> Result<T, ParseError> {
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| ParseError::Encoding { segment: name })?;
    // The decoder message may quote claim values; keep only where it failed
    serde_json::from_slice(&bytes).map_err(|e| ParseError::Structure {
        segment: name,
        category: match e.classify() {
            Category::Io => "io",
            Category::Syntax => "syntax",
            Category::Data => "data",
            Category::Eof => "eof",
        },
        line: e.line(),
        column: e.column(),
    })
}

/// Log-safe stand-in for a bearer token.
///
/// Renders as `jwt#` followed by the first 12 hex digits of the token's
/// SHA-256, so log lines about the same token correlate without revealing it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MaskedToken(String);

impl MaskedToken {
    /// Mask any bearer string, well-formed or not.
    #[must_use]
    pub fn of(raw: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(raw.as_bytes());
        let digest = hasher.finalize();
        let fingerprint: String = digest
            .iter()
            .take(6)
            .map(|b| format!("{:02x}", b))
            .collect();
        MaskedToken(format!("jwt#{}", fingerprint))
    }

    /// The masked string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MaskedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
