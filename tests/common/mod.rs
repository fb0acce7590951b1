#![allow(dead_code)]

//! Shared fixtures: token minting, a counting mock JWKS endpoint and
//! authenticator wiring.

use base64::Engine as _;
use brrtauth::security::{
    AuthRequest, IssuerMap, IssuerResolver, OAuthJwtAuthenticator, RealmService,
    RouteMetadataProvider,
};
use brrtauth::AuthOutcome;
use http::header::AUTHORIZATION;
use http::{HeaderMap, HeaderValue, Method};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

pub const ISSUER: &str = "https://idp.example/oauth2/token";
pub const SECRET: &[u8] = b"integration-secret";
pub const KID: &str = "k1";

pub fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

/// HS256 token signed with `secret` under key id `kid`.
pub fn hs256(secret: &[u8], kid: &str, claims: &Value) -> String {
    let header = Header {
        kid: Some(kid.to_string()),
        alg: Algorithm::HS256,
        ..Default::default()
    };
    encode(&header, claims, &EncodingKey::from_secret(secret)).unwrap()
}

/// Claims of a token from [`ISSUER`] valid for ten minutes.
pub fn claims(jti: &str, sub: &str, scope: &str) -> Value {
    json!({
        "iss": ISSUER,
        "sub": sub,
        "jti": jti,
        "scope": scope,
        "azp": "consumer-key-1",
        "exp": now() + 600,
    })
}

/// JWKS document publishing `secret` as an `oct` key.
pub fn oct_jwks(kid: &str, secret: &[u8]) -> String {
    json!({
        "keys": [{
            "kty": "oct",
            "alg": "HS256",
            "kid": kid,
            "k": base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(secret),
        }]
    })
    .to_string()
}

/// JWKS endpoint on 127.0.0.1 that counts the requests it serves.
pub struct MockJwks {
    server: Arc<tiny_http::Server>,
    hits: Arc<AtomicUsize>,
    url: String,
}

impl MockJwks {
    pub fn start(body: String) -> Self {
        Self::sequence(vec![body])
    }

    /// Serve `bodies` in order, one per request, repeating the last one.
    pub fn sequence(bodies: Vec<String>) -> Self {
        let server = Arc::new(tiny_http::Server::http("127.0.0.1:0").unwrap());
        let port = server.server_addr().to_ip().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));

        let srv = Arc::clone(&server);
        let counter = Arc::clone(&hits);
        thread::spawn(move || {
            for request in srv.incoming_requests() {
                let served = counter.fetch_add(1, Ordering::SeqCst);
                let body = bodies[served.min(bodies.len() - 1)].clone();
                let header =
                    tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                        .unwrap();
                let response = tiny_http::Response::from_string(body).with_header(header);
                let _ = request.respond(response);
            }
        });

        Self {
            server,
            hits,
            url: format!("http://127.0.0.1:{}/oauth2/jwks", port),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for MockJwks {
    fn drop(&mut self) {
        self.server.unblock();
    }
}

/// A localhost URL nothing listens on.
pub fn dead_jwks_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{}/oauth2/jwks", port)
}

/// Authenticator with default settings and no clock skew.
pub fn authenticator(
    issuers: IssuerMap,
    routes: Arc<dyn RouteMetadataProvider>,
    realm: Arc<dyn RealmService>,
) -> OAuthJwtAuthenticator {
    OAuthJwtAuthenticator::builder(IssuerResolver::new(issuers), routes, realm)
        .clock_skew_secs(0)
        .build()
}

pub fn bearer(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
    );
    headers
}

/// Authenticate `token` for `method path` on the `/api` `/v1` API.
pub fn call(
    auth: &OAuthJwtAuthenticator,
    token: &str,
    method: Method,
    path: &str,
) -> AuthOutcome {
    let headers = bearer(token);
    let request = AuthRequest::new(&headers, &method, path).api("/api", "/v1");
    auth.authenticate(&request).unwrap()
}
