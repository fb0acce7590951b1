//! Tenant binding for authenticated requests.
//!
//! The subject claim is tenant-qualified: `alice@acme.com` is user `alice` in
//! tenant `acme.com`. A subject without `@` belongs to the super tenant.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use super::error::InfrastructureError;

/// Domain of the super tenant unless configured otherwise.
pub const DEFAULT_SUPER_TENANT_DOMAIN: &str = "carbon.super";
/// Tenant id of the super tenant.
pub const SUPER_TENANT_ID: i32 = -1234;
const TENANT_SEPARATOR: char = '@';

/// Identity of an authenticated request.
///
/// Built once per successful authentication and owned by that request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthContext {
    /// Tenant the subject belongs to
    pub tenant_domain: String,
    /// Tenant id from the realm service
    pub tenant_id: i32,
    /// Tenant-aware username
    pub username: String,
    /// Scopes granted by the token
    pub scopes: Vec<String>,
    /// Organization the request acts in
    pub organization: String,
    /// Authorized party (`azp`), the OAuth2 client
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer_key: Option<String>,
    /// Subject claim as presented
    pub subject: String,
}

/// Multi-tenant realm / user-store service.
pub trait RealmService: Send + Sync {
    /// Id of the tenant with `tenant_domain`.
    fn tenant_id(&self, tenant_domain: &str) -> Result<i32, String>;

    /// Warm up a non-super tenant after a user of it authenticated.
    fn load_tenant_config(&self, _tenant_domain: &str) -> Result<(), String> {
        Ok(())
    }
}

/// Realm service backed by a map. The super tenant is always present.
#[derive(Debug)]
pub struct InMemoryRealm {
    tenants: RwLock<HashMap<String, i32>>,
    loaded: RwLock<Vec<String>>,
}

impl Default for InMemoryRealm {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRealm {
    /// Realm containing only [`DEFAULT_SUPER_TENANT_DOMAIN`].
    pub fn new() -> Self {
        let mut tenants = HashMap::new();
        tenants.insert(DEFAULT_SUPER_TENANT_DOMAIN.to_string(), SUPER_TENANT_ID);
        Self {
            tenants: RwLock::new(tenants),
            loaded: RwLock::new(Vec::new()),
        }
    }

    /// Add or replace a tenant.
    pub fn add_tenant(&self, tenant_domain: &str, tenant_id: i32) {
        if let Ok(mut tenants) = self.tenants.write() {
            tenants.insert(tenant_domain.to_string(), tenant_id);
        }
    }

    /// Tenants whose configuration was loaded, in order.
    pub fn loaded_tenants(&self) -> Vec<String> {
        self.loaded.read().map(|l| l.clone()).unwrap_or_default()
    }
}

impl RealmService for InMemoryRealm {
    fn tenant_id(&self, tenant_domain: &str) -> Result<i32, String> {
        let tenants = self
            .tenants
            .read()
            .map_err(|_| "tenant store lock poisoned".to_string())?;
        tenants
            .get(tenant_domain)
            .copied()
            .ok_or_else(|| format!("tenant '{}' does not exist", tenant_domain))
    }

    fn load_tenant_config(&self, tenant_domain: &str) -> Result<(), String> {
        let mut loaded = self
            .loaded
            .write()
            .map_err(|_| "tenant store lock poisoned".to_string())?;
        loaded.push(tenant_domain.to_string());
        Ok(())
    }
}

/// Derives tenant identity from a subject and binds it into an [`AuthContext`].
pub struct TenantContextBinder {
    realm: Arc<dyn RealmService>,
    super_tenant_domain: String,
    email_username_enabled: bool,
}

impl TenantContextBinder {
    /// Binder over `realm` with the default super tenant and email usernames off.
    pub fn new(realm: Arc<dyn RealmService>) -> Self {
        Self {
            realm,
            super_tenant_domain: DEFAULT_SUPER_TENANT_DOMAIN.to_string(),
            email_username_enabled: false,
        }
    }

    /// Override the super tenant domain.
    pub fn super_tenant_domain(mut self, domain: impl Into<String>) -> Self {
        self.super_tenant_domain = domain.into();
        self
    }

    /// Treat super tenant usernames as email addresses.
    pub fn email_username_enabled(mut self, enabled: bool) -> Self {
        self.email_username_enabled = enabled;
        self
    }

    /// Tenant domain of `subject`: the part after the last `@`, else the super tenant.
    pub fn tenant_domain_of(&self, subject: &str) -> String {
        match subject.rfind(TENANT_SEPARATOR) {
            Some(idx) if idx + 1 < subject.len() => subject[idx + 1..].to_string(),
            _ => self.super_tenant_domain.clone(),
        }
    }

    /// Username as seen inside its tenant.
    ///
    /// Only super tenant subjects are rewritten, and only when email usernames
    /// are enabled or the subject ends with the super tenant suffix and holds
    /// a single `@`. `bob@gmail.com@carbon.super` with email usernames off is
    /// left alone. Subjects of other tenants keep their qualified form.
    pub fn tenant_aware_username(&self, subject: &str, tenant_domain: &str) -> String {
        if tenant_domain != self.super_tenant_domain {
            return subject.to_string();
        }
        let separators = subject.matches(TENANT_SEPARATOR).count();
        let suffix = format!("{}{}", TENANT_SEPARATOR, self.super_tenant_domain);
        if self.email_username_enabled || (subject.ends_with(&suffix) && separators <= 1) {
            strip_tenant(subject)
        } else {
            subject.to_string()
        }
    }

    /// Build the request's [`AuthContext`].
    ///
    /// `organization` defaults to the tenant domain. A realm lookup failure is
    /// [`InfrastructureError::TenantResolution`]; a failed tenant warm-up is
    /// only logged.
    pub fn bind(
        &self,
        subject: &str,
        scopes: Vec<String>,
        organization: Option<&str>,
        consumer_key: Option<&str>,
    ) -> Result<AuthContext, InfrastructureError> {
        let tenant_domain = self.tenant_domain_of(subject);
        let username = self.tenant_aware_username(subject, &tenant_domain);
        let tenant_id = self.realm.tenant_id(&tenant_domain).map_err(|error| {
            InfrastructureError::TenantResolution {
                tenant_domain: tenant_domain.clone(),
                error,
            }
        })?;

        if tenant_domain != self.super_tenant_domain {
            if let Err(error) = self.realm.load_tenant_config(&tenant_domain) {
                warn!(tenant_domain = %tenant_domain, error = %error, "failed to load tenant configuration");
            }
        }

        debug!(tenant_domain = %tenant_domain, tenant_id, username = %username, "tenant context bound");
        Ok(AuthContext {
            organization: organization
                .filter(|o| !o.is_empty())
                .map_or_else(|| tenant_domain.clone(), str::to_string),
            tenant_domain,
            tenant_id,
            username,
            scopes,
            consumer_key: consumer_key.map(str::to_string),
            subject: subject.to_string(),
        })
    }
}

fn strip_tenant(subject: &str) -> String {
    match subject.rfind(TENANT_SEPARATOR) {
        Some(idx) => subject[..idx].to_string(),
        None => subject.to_string(),
    }
}
