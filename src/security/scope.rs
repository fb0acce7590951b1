//! Scope authorization against URI templates.
//!
//! Granted scopes come from the token's `scope` claim split on a delimiter.
//! Required scopes come from the [`UriTemplate`]s an API registers for its
//! base path and version. A route is authorized when its required set is
//! empty or shares at least one scope with the granted set.

use http::Method;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use super::error::Rejection;

/// One operation of an API: method, path template and the scopes it needs.
#[derive(Debug, Clone)]
pub struct UriTemplate {
    method: Method,
    template: String,
    scopes: BTreeSet<String>,
    matcher: Regex,
}

impl UriTemplate {
    /// Compile `template` (e.g. `/apis/{apiId}/docs`). Each `{var}` segment
    /// matches exactly one path segment.
    pub fn new<I, S>(method: Method, template: &str, scopes: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(Self {
            method,
            template: template.to_string(),
            scopes: scopes.into_iter().map(Into::into).collect(),
            matcher: template_to_regex(template)?,
        })
    }

    /// HTTP method of the operation.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Path template as registered.
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Scopes the operation requires.
    pub fn scopes(&self) -> &BTreeSet<String> {
        &self.scopes
    }

    /// Whether a request for `method` on `path` addresses this operation.
    pub fn matches(&self, method: &Method, path: &str) -> bool {
        self.method == *method && self.matcher.is_match(path)
    }
}

fn template_to_regex(template: &str) -> Result<Regex, regex::Error> {
    let mut pattern = String::with_capacity(template.len() + 8);
    pattern.push('^');
    for segment in template.split('/') {
        if segment.starts_with('{') && segment.ends_with('}') {
            pattern.push_str("/[^/]+");
        } else if !segment.is_empty() {
            pattern.push('/');
            pattern.push_str(&regex::escape(segment));
        }
    }
    if pattern.len() == 1 {
        pattern.push('/');
    } else {
        pattern.push_str("/?");
    }
    pattern.push('$');
    Regex::new(&pattern)
}

/// Supplies the URI templates registered for an API.
pub trait RouteMetadataProvider: Send + Sync {
    /// Templates of the API at `base_path` + `version`.
    fn uri_templates(&self, base_path: &str, version: &str) -> Vec<Arc<UriTemplate>>;

    /// Union of the scopes of every template matching `method` and `path`,
    /// or `None` when no template matches.
    fn required_scopes(
        &self,
        base_path: &str,
        version: &str,
        method: &Method,
        path: &str,
    ) -> Option<BTreeSet<String>> {
        let mut matched = false;
        let mut required = BTreeSet::new();
        for template in self.uri_templates(base_path, version) {
            if template.matches(method, path) {
                matched = true;
                required.extend(template.scopes().iter().cloned());
            }
        }
        matched.then_some(required)
    }
}

/// Route metadata held in memory.
#[derive(Debug, Default)]
pub struct InMemoryRouteMetadata {
    templates: RwLock<HashMap<String, Vec<Arc<UriTemplate>>>>,
}

impl InMemoryRouteMetadata {
    /// No APIs registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `template` to the API at `base_path` + `version`.
    pub fn register(&self, base_path: &str, version: &str, template: UriTemplate) {
        if let Ok(mut templates) = self.templates.write() {
            templates
                .entry(api_key(base_path, version))
                .or_default()
                .push(Arc::new(template));
        }
    }
}

impl RouteMetadataProvider for InMemoryRouteMetadata {
    fn uri_templates(&self, base_path: &str, version: &str) -> Vec<Arc<UriTemplate>> {
        self.templates
            .read()
            .ok()
            .and_then(|t| t.get(&api_key(base_path, version)).cloned())
            .unwrap_or_default()
    }
}

fn api_key(base_path: &str, version: &str) -> String {
    format!("{}{}", base_path, version)
}

/// Splits scope claims and checks them against route requirements.
#[derive(Debug, Clone)]
pub struct ScopeAuthorizer {
    delimiter: String,
}

impl Default for ScopeAuthorizer {
    fn default() -> Self {
        Self::new(" ")
    }
}

impl ScopeAuthorizer {
    /// Authorizer splitting scope claims on `delimiter`.
    pub fn new(delimiter: impl Into<String>) -> Self {
        let delimiter = delimiter.into();
        Self {
            delimiter: if delimiter.is_empty() {
                " ".to_string()
            } else {
                delimiter
            },
        }
    }

    /// Scopes granted by a `scope` claim.
    ///
    /// A missing claim is [`Rejection::NoScopesPresented`]; an empty claim is
    /// an empty grant.
    pub fn granted_scopes(&self, claim: Option<&str>) -> Result<Vec<String>, Rejection> {
        let claim = claim.ok_or(Rejection::NoScopesPresented)?;
        Ok(claim
            .split(self.delimiter.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Any single granted scope in `required` is enough.
    // TODO: confirm with API owners whether routes should require every scope
    pub fn authorize(&self, granted: &[String], required: &BTreeSet<String>) -> bool {
        required.is_empty() || granted.iter().any(|s| required.contains(s))
    }

    /// Parse the claim and authorize it, returning the granted scopes.
    pub fn check(
        &self,
        claim: Option<&str>,
        required: &BTreeSet<String>,
    ) -> Result<Vec<String>, Rejection> {
        let granted = self.granted_scopes(claim)?;
        if self.authorize(&granted, required) {
            Ok(granted)
        } else {
            Err(Rejection::InsufficientScope {
                required: required.iter().cloned().collect(),
                granted,
            })
        }
    }
}
