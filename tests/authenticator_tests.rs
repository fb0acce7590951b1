mod common;

use brrtauth::security::{
    AuthRequest, FederatedAuthenticatorConfig, IdentityProvider, InMemoryIdentityProviders,
    InMemoryKeyManagers, InMemoryRealm, InMemoryRouteMetadata, InfrastructureError, IssuerMap,
    IssuerResolver, JwksKeySet, JwksSettings, OAuthJwtAuthenticator, Property, Rejection,
    UriTemplate, Validator, JWKS_URI, OIDC_AUTHENTICATOR, OIDC_IDP_ENTITY_ID,
};
use brrtauth::{AuthConfig, AuthOutcome};
use common::*;
use http::{HeaderMap, Method};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn routes() -> Arc<InMemoryRouteMetadata> {
    let routes = Arc::new(InMemoryRouteMetadata::new());
    routes.register(
        "/api",
        "/v1",
        UriTemplate::new(Method::GET, "/pets/{id}", ["api:read"]).unwrap(),
    );
    routes.register(
        "/api",
        "/v1",
        UriTemplate::new(Method::POST, "/pets", ["api:write", "api:admin"]).unwrap(),
    );
    routes.register(
        "/api",
        "/v1",
        UriTemplate::new(Method::GET, "/health", Vec::<String>::new()).unwrap(),
    );
    routes
}

fn realm() -> Arc<InMemoryRealm> {
    let realm = Arc::new(InMemoryRealm::new());
    realm.add_tenant("acme.com", 7);
    realm
}

fn jwks_validator(url: &str) -> Arc<Validator> {
    let keys = JwksKeySet::new(url, JwksSettings::default()).unwrap();
    Arc::new(Validator::jwks(ISSUER, Arc::new(keys)))
}

fn static_issuers(url: &str) -> IssuerMap {
    let mut issuers = IssuerMap::new();
    issuers.insert(ISSUER.to_string(), jwks_validator(url));
    issuers
}

fn jwks_authenticator(jwks: &MockJwks) -> OAuthJwtAuthenticator {
    authenticator(static_issuers(jwks.url()), routes(), realm())
}

fn rejection(outcome: AuthOutcome) -> Rejection {
    match outcome {
        AuthOutcome::Rejected(reason) => reason,
        AuthOutcome::Authenticated(ctx) => panic!("expected rejection, got {:?}", ctx),
    }
}

#[test]
fn test_end_to_end_authenticates_tenant_user() {
    let jwks = MockJwks::start(oct_jwks(KID, SECRET));
    let auth = jwks_authenticator(&jwks);
    let token = hs256(SECRET, KID, &claims("e2e-1", "alice@acme.com", "api:read"));

    let outcome = call(&auth, &token, Method::GET, "/pets/42");
    let context = outcome.context().expect("authenticated");
    assert_eq!(context.tenant_domain, "acme.com");
    assert_eq!(context.tenant_id, 7);
    assert_eq!(context.username, "alice@acme.com");
    assert_eq!(context.subject, "alice@acme.com");
    assert_eq!(context.organization, "acme.com");
    assert_eq!(context.scopes, vec!["api:read"]);
    assert_eq!(context.consumer_key.as_deref(), Some("consumer-key-1"));
    assert_eq!(jwks.hits(), 1);
}

#[test]
fn test_super_tenant_subject() {
    let jwks = MockJwks::start(oct_jwks(KID, SECRET));
    let auth = jwks_authenticator(&jwks);

    let token = hs256(SECRET, KID, &claims("super-1", "admin", "api:read"));
    let outcome = call(&auth, &token, Method::GET, "/pets/1");
    let context = outcome.context().expect("authenticated");
    assert_eq!(context.tenant_domain, "carbon.super");
    assert_eq!(context.tenant_id, -1234);
    assert_eq!(context.username, "admin");

    let token = hs256(SECRET, KID, &claims("super-2", "admin@carbon.super", "api:read"));
    let outcome = call(&auth, &token, Method::GET, "/pets/1");
    let context = outcome.context().expect("authenticated");
    assert_eq!(context.tenant_domain, "carbon.super");
    assert_eq!(context.username, "admin");
}

#[test]
fn test_cached_token_is_not_reverified() {
    let jwks = MockJwks::start(oct_jwks(KID, SECRET));
    let auth = jwks_authenticator(&jwks);
    let token = hs256(SECRET, KID, &claims("cached-1", "alice@acme.com", "api:read"));

    assert!(call(&auth, &token, Method::GET, "/pets/1").is_authenticated());
    assert!(call(&auth, &token, Method::GET, "/pets/2").is_authenticated());
    assert!(call(&auth, &token, Method::GET, "/pets/3").is_authenticated());

    assert_eq!(auth.signature_validator().verifications(), 1);
    assert_eq!(jwks.hits(), 1);
    let stats = auth.cache().stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.valid_entries, 1);
}

#[test]
fn test_tampered_token_with_same_identifier_is_rejected() {
    let jwks = MockJwks::start(oct_jwks(KID, SECRET));
    let auth = jwks_authenticator(&jwks);
    let original = hs256(SECRET, KID, &claims("tamper-1", "alice@acme.com", "api:read"));
    assert!(call(&auth, &original, Method::GET, "/pets/1").is_authenticated());

    // Same jti, different payload
    let mut escalated = claims("tamper-1", "alice@acme.com", "api:read api:admin");
    escalated["exp"] = json!(now() + 3600);
    let forged = hs256(b"attacker-secret", KID, &escalated);

    let reason = rejection(call(&auth, &forged, Method::GET, "/pets/1"));
    assert_eq!(reason, Rejection::TamperedToken);
    // The identifier stays burned, even for the original token
    let reason = rejection(call(&auth, &original, Method::GET, "/pets/1"));
    assert_eq!(reason, Rejection::TamperedToken);

    assert_eq!(auth.signature_validator().verifications(), 1);
    let stats = auth.cache().stats();
    assert_eq!(stats.demotions, 1);
    assert_eq!(stats.negative_hits, 1);
    assert_eq!(stats.valid_entries, 0);
    assert_eq!(stats.invalid_entries, 1);
}

#[test]
fn test_expired_cached_token_is_demoted_once() {
    let jwks = MockJwks::start(oct_jwks(KID, SECRET));
    let auth = jwks_authenticator(&jwks);
    let mut short_lived = claims("expiring-1", "alice@acme.com", "api:read");
    short_lived["exp"] = json!(now() + 1);
    let token = hs256(SECRET, KID, &short_lived);

    assert!(call(&auth, &token, Method::GET, "/pets/1").is_authenticated());
    thread::sleep(Duration::from_millis(2100));

    for _ in 0..3 {
        let reason = rejection(call(&auth, &token, Method::GET, "/pets/1"));
        assert_eq!(reason, Rejection::ExpiredToken);
    }
    let stats = auth.cache().stats();
    assert_eq!(stats.demotions, 1);
    assert_eq!(stats.negative_hits, 2);
    assert_eq!(auth.signature_validator().verifications(), 1);
}

#[test]
fn test_static_issuer_map_rejects_other_issuer() {
    let jwks = MockJwks::start(oct_jwks(KID, SECRET));
    let auth = jwks_authenticator(&jwks);
    let mut foreign = claims("foreign-1", "alice@acme.com", "api:read");
    foreign["iss"] = json!("https://other/token");
    let token = hs256(SECRET, KID, &foreign);

    match rejection(call(&auth, &token, Method::GET, "/pets/1")) {
        Rejection::UntrustedIssuer { issuer, .. } => assert_eq!(issuer, "https://other/token"),
        other => panic!("expected untrusted issuer, got {:?}", other),
    }
    assert_eq!(auth.signature_validator().verifications(), 0);
    assert_eq!(jwks.hits(), 0);
}

#[test]
fn test_static_issuers_can_be_replaced() {
    let jwks = MockJwks::start(oct_jwks(KID, SECRET));
    let auth = jwks_authenticator(&jwks);
    let token = hs256(SECRET, KID, &claims("swap-1", "alice@acme.com", "api:read"));
    assert!(call(&auth, &token, Method::GET, "/pets/1").is_authenticated());

    let mut replacement = IssuerMap::new();
    replacement.insert(
        "https://new-idp.example/token".to_string(),
        jwks_validator(jwks.url()),
    );
    auth.issuers().replace_static_issuers(replacement);
    assert_eq!(
        auth.issuers().static_issuers(),
        vec!["https://new-idp.example/token".to_string()]
    );

    let reason = rejection(call(&auth, &token, Method::GET, "/pets/1"));
    assert!(matches!(reason, Rejection::UntrustedIssuer { .. }));
}

#[test]
fn test_unknown_key_id_is_rejected() {
    let jwks = MockJwks::start(oct_jwks(KID, SECRET));
    let auth = jwks_authenticator(&jwks);
    let token = hs256(SECRET, "rotated", &claims("kid-1", "alice@acme.com", "api:read"));

    let reason = rejection(call(&auth, &token, Method::GET, "/pets/1"));
    assert_eq!(
        reason,
        Rejection::UnknownSigningKey {
            kid: Some("rotated".to_string())
        }
    );
    // The fetch made for this request did not publish the kid
    assert_eq!(jwks.hits(), 1);
    assert_eq!(auth.cache().stats().invalid_entries, 1);
}

#[test]
fn test_rotated_signing_key_is_accepted_after_refresh_interval() {
    let jwks = MockJwks::sequence(vec![
        oct_jwks("old", b"old-secret"),
        oct_jwks("new", b"new-secret"),
    ]);
    let settings = JwksSettings {
        min_refresh_interval: Duration::from_secs(1),
        ..JwksSettings::default()
    };
    let keys = JwksKeySet::new(jwks.url(), settings).unwrap();
    let mut issuers = IssuerMap::new();
    issuers.insert(
        ISSUER.to_string(),
        Arc::new(Validator::jwks(ISSUER, Arc::new(keys))),
    );
    let auth = authenticator(issuers, routes(), realm());

    let before = hs256(b"old-secret", "old", &claims("rot-old", "alice@acme.com", "api:read"));
    assert!(call(&auth, &before, Method::GET, "/pets/1").is_authenticated());
    assert_eq!(jwks.hits(), 1);

    // Signed with the rotated key while the refresh is still rate limited
    let after = hs256(b"new-secret", "new", &claims("rot-new", "alice@acme.com", "api:read"));
    assert_eq!(
        rejection(call(&auth, &after, Method::GET, "/pets/1")),
        Rejection::UnknownSigningKey {
            kid: Some("new".to_string())
        }
    );
    assert_eq!(jwks.hits(), 1);
    assert_eq!(auth.cache().stats().invalid_entries, 0);

    thread::sleep(Duration::from_millis(1500));
    assert!(call(&auth, &after, Method::GET, "/pets/1").is_authenticated());
    assert_eq!(jwks.hits(), 2);
}

#[test]
fn test_not_yet_valid_token_passes_once_mature() {
    let jwks = MockJwks::start(oct_jwks(KID, SECRET));
    let auth = jwks_authenticator(&jwks);
    let mut early = claims("nbf-1", "alice@acme.com", "api:read");
    early["nbf"] = json!(now() + 2);
    let token = hs256(SECRET, KID, &early);

    assert_eq!(
        rejection(call(&auth, &token, Method::GET, "/pets/1")),
        Rejection::NotYetValid
    );
    assert_eq!(auth.cache().stats().invalid_entries, 0);

    thread::sleep(Duration::from_millis(3100));
    assert!(call(&auth, &token, Method::GET, "/pets/1").is_authenticated());
}

#[test]
fn test_wrong_signature_is_rejected() {
    let jwks = MockJwks::start(oct_jwks(KID, SECRET));
    let auth = jwks_authenticator(&jwks);
    let token = hs256(b"some-other-secret", KID, &claims("sig-1", "alice@acme.com", "api:read"));

    let reason = rejection(call(&auth, &token, Method::GET, "/pets/1"));
    assert_eq!(reason, Rejection::InvalidSignature);
    assert_eq!(auth.cache().stats().invalid_entries, 1);
}

#[test]
fn test_unreachable_jwks_is_infrastructure_error() {
    let url = dead_jwks_url();
    let settings = JwksSettings {
        timeout: Duration::from_millis(500),
        ..JwksSettings::default()
    };
    let keys = JwksKeySet::new(&url, settings).unwrap();
    let mut issuers = IssuerMap::new();
    issuers.insert(
        ISSUER.to_string(),
        Arc::new(Validator::jwks(ISSUER, Arc::new(keys))),
    );
    let auth = authenticator(issuers, routes(), realm());
    let token = hs256(SECRET, KID, &claims("down-1", "alice@acme.com", "api:read"));

    let headers = bearer(&token);
    let method = Method::GET;
    let request = AuthRequest::new(&headers, &method, "/pets/1").api("/api", "/v1");
    match auth.authenticate(&request) {
        Err(InfrastructureError::JwksUnavailable { url: failed, .. }) => assert_eq!(failed, url),
        other => panic!("expected JWKS failure, got {:?}", other),
    }
    assert!(!auth.is_authenticated(&request));
    // Nothing is cached for an undecided token
    let stats = auth.cache().stats();
    assert_eq!(stats.valid_entries + stats.invalid_entries, 0);
}

#[test]
fn test_scope_rejections() {
    let jwks = MockJwks::start(oct_jwks(KID, SECRET));
    let auth = jwks_authenticator(&jwks);

    let reader = hs256(SECRET, KID, &claims("scope-1", "alice@acme.com", "api:read"));
    match rejection(call(&auth, &reader, Method::POST, "/pets")) {
        Rejection::InsufficientScope { required, granted } => {
            assert_eq!(required, vec!["api:admin", "api:write"]);
            assert_eq!(granted, vec!["api:read"]);
        }
        other => panic!("expected insufficient scope, got {:?}", other),
    }

    let writer = hs256(
        SECRET,
        KID,
        &claims("scope-2", "alice@acme.com", "api:read api:write"),
    );
    assert!(call(&auth, &writer, Method::POST, "/pets").is_authenticated());

    // A route without scopes admits any token that carries a scope claim
    assert!(call(&auth, &reader, Method::GET, "/health").is_authenticated());

    match rejection(call(&auth, &reader, Method::DELETE, "/pets/1")) {
        Rejection::InsufficientScope { required, .. } => assert!(required.is_empty()),
        other => panic!("expected unmatched route denial, got {:?}", other),
    }

    let mut unscoped = claims("scope-3", "alice@acme.com", "");
    unscoped.as_object_mut().unwrap().remove("scope");
    let unscoped = hs256(SECRET, KID, &unscoped);
    assert_eq!(
        rejection(call(&auth, &unscoped, Method::GET, "/health")),
        Rejection::NoScopesPresented
    );
}

#[test]
fn test_missing_and_malformed_bearer() {
    let jwks = MockJwks::start(oct_jwks(KID, SECRET));
    let auth = jwks_authenticator(&jwks);
    let method = Method::GET;

    let empty = HeaderMap::new();
    let request = AuthRequest::new(&empty, &method, "/pets/1").api("/api", "/v1");
    assert_eq!(
        rejection(auth.authenticate(&request).unwrap()),
        Rejection::MissingBearer
    );

    for raw in ["abc", "a.b", "a.b.c.d", "not.a.jwt"] {
        let reason = rejection(call(&auth, raw, Method::GET, "/pets/1"));
        assert!(
            matches!(reason, Rejection::MalformedToken { .. }),
            "{} gave {:?}",
            raw,
            reason
        );
    }
    assert_eq!(auth.signature_validator().verifications(), 0);
    assert_eq!(jwks.hits(), 0);
}

#[test]
fn test_unknown_tenant_is_infrastructure_error() {
    let jwks = MockJwks::start(oct_jwks(KID, SECRET));
    let auth = jwks_authenticator(&jwks);
    let token = hs256(SECRET, KID, &claims("tenant-1", "carol@nowhere.example", "api:read"));

    let headers = bearer(&token);
    let method = Method::GET;
    let request = AuthRequest::new(&headers, &method, "/pets/1").api("/api", "/v1");
    match auth.authenticate(&request) {
        Err(InfrastructureError::TenantResolution { tenant_domain, .. }) => {
            assert_eq!(tenant_domain, "nowhere.example")
        }
        other => panic!("expected tenant resolution failure, got {:?}", other),
    }
}

#[test]
fn test_concurrent_requests_share_one_cache_entry() {
    let jwks = MockJwks::start(oct_jwks(KID, SECRET));
    let auth = Arc::new(jwks_authenticator(&jwks));
    // Warm the key set so the threads race on the cache only
    let warm = hs256(SECRET, KID, &claims("warm-1", "alice@acme.com", "api:read"));
    assert!(call(&auth, &warm, Method::GET, "/pets/1").is_authenticated());

    let token = Arc::new(hs256(
        SECRET,
        KID,
        &claims("concurrent-1", "alice@acme.com", "api:read"),
    ));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let auth = Arc::clone(&auth);
            let token = Arc::clone(&token);
            thread::spawn(move || {
                (0..20)
                    .all(|_| call(&auth, &token, Method::GET, "/pets/7").is_authenticated())
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.join().unwrap());
    }

    let verifications = auth.signature_validator().verifications();
    // Racing first lookups may verify redundantly, never more than once per thread
    assert!((2..=9).contains(&verifications), "{}", verifications);
    assert_eq!(jwks.hits(), 1);
    assert_eq!(auth.cache().stats().valid_entries, 2);
}

fn es256_idp() -> (EncodingKey, IdentityProvider) {
    let cert = rcgen::generate_simple_self_signed(vec!["idp.acme.com".to_string()]).unwrap();
    let key = EncodingKey::from_ec_pem(cert.serialize_private_key_pem().as_bytes()).unwrap();
    let idp = IdentityProvider {
        name: "Resident".to_string(),
        certificate: Some(cert.serialize_pem().unwrap()),
        properties: Vec::new(),
        federated_authenticators: vec![FederatedAuthenticatorConfig {
            name: OIDC_AUTHENTICATOR.to_string(),
            properties: vec![Property::new(OIDC_IDP_ENTITY_ID, ISSUER)],
        }],
    };
    (key, idp)
}

#[test]
fn test_resident_identity_provider_certificate() {
    let (key, idp) = es256_idp();
    let idps = Arc::new(InMemoryIdentityProviders::new());
    idps.insert("acme.com", idp);
    let resolver = IssuerResolver::new(IssuerMap::new()).with_identity_providers(idps);
    let auth = OAuthJwtAuthenticator::builder(resolver, routes(), realm()).build();

    let token = encode(
        &Header::new(Algorithm::ES256),
        &claims("resident-1", "alice@acme.com", "api:read"),
        &key,
    )
    .unwrap();
    let outcome = call(&auth, &token, Method::GET, "/pets/1");
    assert_eq!(outcome.context().map(|c| c.tenant_id), Some(7));

    // Another organization has no resident provider at all
    let token = encode(
        &Header::new(Algorithm::ES256),
        &claims("resident-2", "bob@globex.example", "api:read"),
        &key,
    )
    .unwrap();
    let headers = bearer(&token);
    let method = Method::GET;
    let request = AuthRequest::new(&headers, &method, "/pets/1").api("/api", "/v1");
    assert!(matches!(
        auth.authenticate(&request),
        Err(InfrastructureError::IdentityProvider { .. })
    ));
}

#[test]
fn test_resident_identity_provider_jwks_is_shared() {
    let jwks = MockJwks::start(oct_jwks(KID, SECRET));
    let idp = IdentityProvider {
        name: "Resident".to_string(),
        certificate: None,
        properties: vec![Property::new(JWKS_URI, jwks.url())],
        federated_authenticators: vec![FederatedAuthenticatorConfig {
            name: OIDC_AUTHENTICATOR.to_string(),
            properties: vec![Property::new(OIDC_IDP_ENTITY_ID, ISSUER)],
        }],
    };
    let idps = Arc::new(InMemoryIdentityProviders::new());
    idps.insert("acme.com", idp);
    let resolver = IssuerResolver::new(IssuerMap::new()).with_identity_providers(idps);
    let auth = OAuthJwtAuthenticator::builder(resolver, routes(), realm()).build();

    for jti in ["shared-1", "shared-2", "shared-3"] {
        let token = hs256(SECRET, KID, &claims(jti, "alice@acme.com", "api:read"));
        assert!(call(&auth, &token, Method::GET, "/pets/1").is_authenticated());
    }
    assert_eq!(auth.signature_validator().verifications(), 3);
    assert_eq!(jwks.hits(), 1);
}

#[test]
fn test_key_manager_registry_wins_over_resident_provider() {
    let jwks = MockJwks::start(oct_jwks(KID, SECRET));
    let key_managers = Arc::new(InMemoryKeyManagers::new());
    let keys = JwksKeySet::new(jwks.url(), JwksSettings::default()).unwrap();
    key_managers.register("acme.com", Validator::jwks(ISSUER, Arc::new(keys)));
    // Resident provider that would fail if consulted
    let idps = Arc::new(InMemoryIdentityProviders::new());

    let resolver = IssuerResolver::new(IssuerMap::new())
        .with_key_managers(key_managers)
        .with_identity_providers(idps);
    let auth = OAuthJwtAuthenticator::builder(resolver, routes(), realm()).build();

    let token = hs256(SECRET, KID, &claims("km-1", "alice@acme.com", "api:read"));
    assert!(call(&auth, &token, Method::GET, "/pets/1").is_authenticated());
}

#[test]
fn test_authenticator_from_config_file() {
    let jwks = MockJwks::start(oct_jwks(KID, SECRET));
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    write!(
        file,
        r#"
clock_skew_secs: 0
scope_delimiter: ","
token_issuers:
  "{issuer}":
    jwks_url: "{url}"
    audience: gateway
"#,
        issuer = ISSUER,
        url = jwks.url()
    )
    .unwrap();

    let config = AuthConfig::load(file.path()).unwrap();
    let auth = config
        .authenticator_builder(config.issuer_resolver().unwrap(), routes(), realm())
        .unwrap()
        .build();

    let mut with_audience = claims("config-1", "alice@acme.com", "api:write,api:read");
    with_audience["aud"] = json!("gateway");
    let token = hs256(SECRET, KID, &with_audience);
    let outcome = call(&auth, &token, Method::GET, "/pets/1");
    assert_eq!(
        outcome.context().map(|c| c.scopes.clone()),
        Some(vec!["api:write".to_string(), "api:read".to_string()])
    );

    let mut other_audience = claims("config-2", "alice@acme.com", "api:read");
    other_audience["aud"] = json!("someone-else");
    let token = hs256(SECRET, KID, &other_audience);
    assert_eq!(
        rejection(call(&auth, &token, Method::GET, "/pets/1")),
        Rejection::InvalidAudience
    );
}
