//! Refreshable JSON Web Key Set owned by a JWKS trust anchor.
//!
//! Key rotation is the key set's responsibility: keys are cached for a TTL,
//! an unknown `kid` forces one early refresh (rate limited), and concurrent
//! refreshes are debounced so a cold cache under load issues one HTTP request.

use base64::Engine as _;
use jsonwebtoken::DecodingKey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use url::Url;

/// Fetch and caching knobs shared by every JWKS key set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JwksSettings {
    /// Per-request HTTP timeout
    pub timeout: Duration,
    /// How long fetched keys are used before the next access refetches them
    pub cache_ttl: Duration,
    /// Minimum gap between fetch attempts (unknown `kid`, failed refresh)
    pub min_refresh_interval: Duration,
}

impl Default for JwksSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2000),
            cache_ttl: Duration::from_secs(300),
            min_refresh_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Default)]
struct KeyCache {
    fetched_at: Option<Instant>,
    last_attempt: Option<Instant>,
    keys: HashMap<String, DecodingKey>,
}

struct CacheState {
    fresh: bool,
    has_keys: bool,
    attempt_allowed: bool,
}

/// Error raised when the key set cannot be (re)loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JwksFetchError(pub String);

/// Keys published by one JWKS endpoint.
pub struct JwksKeySet {
    url: String,
    settings: JwksSettings,
    cache: Mutex<KeyCache>,
    refresh_in_progress: AtomicBool,
    fetches: AtomicU64,
}

/// Result of resolving a `kid` against a key set.
pub enum KeyLookup {
    /// Key published under the requested `kid`.
    Found(DecodingKey),
    /// The endpoint was fetched for this lookup and does not publish the `kid`.
    Missing,
    /// The `kid` is unknown and the refresh rate limit blocked a new fetch.
    /// The key may still appear once the limit elapses.
    RefreshSuppressed,
}

impl JwksKeySet {
    /// Create a key set for `url`. Nothing is fetched until a key is needed.
    ///
    /// The URL must be HTTPS; plain HTTP is only accepted for exact
    /// `localhost` / `127.0.0.1` hosts.
    pub fn new(url: &str, settings: JwksSettings) -> Result<Self, String> {
        let parsed = Url::parse(url).map_err(|e| format!("JWKS URL is invalid: {}", e))?;
        match parsed.scheme() {
            "https" => {}
            "http" => {
                // Exact hosts only: `localhost.attacker.com` must not pass
                let host = parsed
                    .host_str()
                    .ok_or_else(|| "JWKS URL must have a valid hostname".to_string())?;
                if host != "localhost" && host != "127.0.0.1" {
                    return Err(format!(
                        "JWKS URL must use HTTPS (HTTP only allowed for localhost/127.0.0.1), got host '{}'",
                        host
                    ));
                }
            }
            other => {
                return Err(format!("JWKS URL scheme '{}' is not supported", other));
            }
        }
        Ok(Self {
            url: url.to_string(),
            settings,
            cache: Mutex::new(KeyCache::default()),
            refresh_in_progress: AtomicBool::new(false),
            fetches: AtomicU64::new(0),
        })
    }

    /// Endpoint this key set is loaded from.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Number of completed HTTP fetches (successful or not).
    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Resolve the verification key for a token header `kid`.
    ///
    /// `Err` means the endpoint could not be read at all and no previously
    /// fetched keys are available. A header without `kid` is accepted only
    /// when the set holds exactly one key.
    pub fn key_for(&self, kid: Option<&str>) -> Result<KeyLookup, JwksFetchError> {
        let state = self.cache_state();
        let mut fetched = false;
        if !state.fresh && (state.attempt_allowed || !state.has_keys) {
            match self.refresh() {
                Ok(()) => fetched = true,
                Err(e) => {
                    if !state.has_keys {
                        return Err(e);
                    }
                    warn!(url = %self.url, error = %e.0, "JWKS refresh failed, using stale keys");
                }
            }
        }

        if let Some(key) = self.lookup(kid) {
            return Ok(KeyLookup::Found(key));
        }
        if fetched {
            return Ok(KeyLookup::Missing);
        }

        // Unknown kid: the issuer may have rotated keys since the last fetch
        if self.cache_state().attempt_allowed {
            debug!(url = %self.url, kid = ?kid, "unknown kid, forcing JWKS refresh");
            self.refresh()?;
            return Ok(self.lookup(kid).map_or(KeyLookup::Missing, KeyLookup::Found));
        }
        debug!(url = %self.url, kid = ?kid, "unknown kid, JWKS refresh rate limited");
        Ok(KeyLookup::RefreshSuppressed)
    }

    fn cache_state(&self) -> CacheState {
        match self.cache.lock() {
            Ok(guard) => CacheState {
                fresh: guard
                    .fetched_at
                    .map(|t| t.elapsed() < self.settings.cache_ttl)
                    .unwrap_or(false),
                has_keys: !guard.keys.is_empty(),
                attempt_allowed: guard
                    .last_attempt
                    .map(|t| t.elapsed() >= self.settings.min_refresh_interval)
                    .unwrap_or(true),
            },
            Err(_) => CacheState {
                fresh: false,
                has_keys: false,
                attempt_allowed: false,
            },
        }
    }

    fn lookup(&self, kid: Option<&str>) -> Option<DecodingKey> {
        let guard = self.cache.lock().ok()?;
        match kid {
            Some(kid) => guard.keys.get(kid).cloned(),
            None if guard.keys.len() == 1 => guard.keys.values().next().cloned(),
            None => None,
        }
    }

    fn refresh(&self) -> Result<(), JwksFetchError> {
        // Debounce: only one thread fetches, the rest wait for its result
        if self
            .refresh_in_progress
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            let start = Instant::now();
            let budget = self.settings.timeout * 2 + Duration::from_millis(100);
            let mut wait_ms = 10;
            while self.refresh_in_progress.load(Ordering::Acquire) {
                if start.elapsed() >= budget {
                    warn!(url = %self.url, "timed out waiting for concurrent JWKS refresh");
                    break;
                }
                std::thread::sleep(Duration::from_millis(wait_ms));
                wait_ms = (wait_ms * 2).min(100);
            }
            return if self.cache_state().has_keys {
                Ok(())
            } else {
                Err(JwksFetchError(
                    "concurrent JWKS refresh produced no keys".to_string(),
                ))
            };
        }

        // Failed fetches also count toward the refresh rate limit
        if let Ok(mut guard) = self.cache.lock() {
            guard.last_attempt = Some(Instant::now());
        }
        let result = self.fetch().map(|keys| {
            if let Ok(mut guard) = self.cache.lock() {
                guard.fetched_at = Some(Instant::now());
                guard.keys = keys;
            }
        });
        self.refresh_in_progress.store(false, Ordering::Release);
        result
    }

    fn fetch(&self) -> Result<HashMap<String, DecodingKey>, JwksFetchError> {
        let started = Instant::now();
        let client = reqwest::blocking::Client::builder()
            .timeout(self.settings.timeout)
            .build()
            .map_err(|e| JwksFetchError(format!("cannot build HTTP client: {}", e)))?;

        let mut last_error = String::from("no attempt made");
        let mut body = None;
        for _ in 0..2 {
            match client
                .get(&self.url)
                .send()
                .and_then(|r| r.error_for_status())
                .and_then(|r| r.text())
            {
                Ok(text) => {
                    body = Some(text);
                    break;
                }
                Err(e) => last_error = e.to_string(),
            }
        }
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let body = body.ok_or(JwksFetchError(last_error))?;

        let parsed: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| JwksFetchError(format!("JWKS body is not JSON: {}", e)))?;
        let keys = parse_jwks(&parsed);
        debug!(
            url = %self.url,
            keys = keys.len(),
            elapsed = ?started.elapsed(),
            "JWKS refresh completed"
        );
        Ok(keys)
    }
}

/// Decode every supported key in a JWKS document, keyed by `kid`.
///
/// Supported: `oct` (HS*), `RSA` (RS*/PS*) and `EC` (ES256/ES384). Keys with
/// an unsupported type or missing components are skipped.
pub(crate) fn parse_jwks(doc: &serde_json::Value) -> HashMap<String, DecodingKey> {
    let mut map = HashMap::new();
    let Some(keys) = doc.get("keys").and_then(|v| v.as_array()) else {
        return map;
    };
    for k in keys {
        let kid = k.get("kid").and_then(|v| v.as_str()).unwrap_or("");
        let kty = k.get("kty").and_then(|v| v.as_str()).unwrap_or("");
        let alg = k.get("alg").and_then(|v| v.as_str()).unwrap_or("");
        let field = |name: &str| k.get(name).and_then(|v| v.as_str());

        let key = if kty.eq_ignore_ascii_case("oct") && (alg.is_empty() || alg.starts_with("HS")) {
            field("k")
                .and_then(|kval| {
                    base64::engine::general_purpose::URL_SAFE_NO_PAD
                        .decode(kval)
                        .ok()
                })
                .map(|secret| DecodingKey::from_secret(&secret))
        } else if kty.eq_ignore_ascii_case("RSA")
            && (alg.is_empty() || alg.starts_with("RS") || alg.starts_with("PS"))
        {
            match (field("n"), field("e")) {
                (Some(n), Some(e)) => DecodingKey::from_rsa_components(n, e).ok(),
                _ => None,
            }
        } else if kty.eq_ignore_ascii_case("EC") && (alg.is_empty() || alg.starts_with("ES")) {
            match (field("x"), field("y")) {
                (Some(x), Some(y)) => DecodingKey::from_ec_components(x, y).ok(),
                _ => None,
            }
        } else {
            None
        };

        match key {
            Some(key) => {
                map.insert(kid.to_string(), key);
            }
            None => debug!(kid, kty, alg, "skipping unsupported JWK"),
        }
    }
    map
}
