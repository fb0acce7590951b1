use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use http::header::AUTHORIZATION;
use http::{HeaderMap, HeaderValue, Method};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::AuthConfig;
use crate::logging::{init_logging, LogConfig};
use crate::security::{
    AuthOutcome, AuthRequest, InMemoryRealm, InMemoryRouteMetadata, ScopeAuthorizer, UriTemplate,
};
use crate::token::ParsedToken;

/// Command-line interface for brrtauth
#[derive(Parser)]
#[command(name = "brrtauth")]
#[command(about = "Inspect and verify OAuth2 bearer JWTs", long_about = None)]
pub struct Cli {
    /// Verbose pretty logging on stderr
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,

    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Decode a token without verifying it
    Inspect {
        /// Raw JWT (without the `Bearer` prefix)
        #[arg(short, long, env = "BRRTAUTH_TOKEN", hide_env_values = true)]
        token: String,
    },
    /// Authenticate a token against a config file's token issuers
    Verify {
        /// Auth config (YAML, TOML or JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Raw JWT (without the `Bearer` prefix)
        #[arg(short, long, env = "BRRTAUTH_TOKEN", hide_env_values = true)]
        token: String,

        /// Request method
        #[arg(short, long, default_value = "GET")]
        method: String,

        /// Resource path, relative to the API base path
        #[arg(short, long, default_value = "/")]
        path: String,

        /// Scopes the route requires (comma-separated or repeated)
        #[arg(short, long, value_delimiter = ',')]
        scopes: Vec<String>,

        /// Organization resolved by the gateway
        #[arg(long)]
        organization: Option<String>,

        /// Known tenants as `domain=id` (repeatable); the super tenant is implicit
        #[arg(long = "tenant", value_parser = parse_tenant)]
        tenants: Vec<(String, i32)>,
    },
}

fn parse_tenant(s: &str) -> Result<(String, i32), String> {
    let (domain, id) = s
        .split_once('=')
        .ok_or_else(|| format!("expected domain=id, got '{}'", s))?;
    let id = id
        .trim()
        .parse()
        .map_err(|_| format!("tenant id '{}' is not an integer", id))?;
    Ok((domain.trim().to_string(), id))
}

/// Run a parsed command. Returns whether the command "succeeded": for
/// `verify`, whether the token was authenticated.
pub fn run_cli(cli: Cli) -> Result<bool> {
    let log_config = if cli.verbose {
        LogConfig::default_dev()
    } else {
        LogConfig::from_env()
    };
    // A subscriber may already be installed when embedded
    if let Err(e) = init_logging(&log_config) {
        eprintln!("Warning: {e:#}");
    }

    match cli.command {
        Commands::Inspect { token } => {
            let summary = inspect(&token)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(true)
        }
        Commands::Verify {
            config,
            token,
            method,
            path,
            scopes,
            organization,
            tenants,
        } => {
            let config = AuthConfig::load(&config)?;
            let method = Method::from_str(&method.to_ascii_uppercase())
                .with_context(|| format!("invalid method '{}'", method))?;
            let outcome = verify(
                &config,
                &token,
                &method,
                &path,
                &scopes,
                organization.as_deref(),
                &tenants,
            )?;
            let authenticated = outcome.is_authenticated();
            println!("{}", serde_json::to_string_pretty(&outcome_json(&outcome))?);
            Ok(authenticated)
        }
    }
}

pub(crate) fn inspect(raw: &str) -> Result<Value> {
    let token = ParsedToken::parse(raw).map_err(|e| anyhow!("Not a JWT token: {}", e))?;
    let claims = token.claims();
    let scopes = ScopeAuthorizer::default()
        .granted_scopes(claims.scope.as_deref())
        .ok();
    Ok(json!({
        "token": token.masked().as_str(),
        "alg": format!("{:?}", token.header().alg),
        "kid": token.header().kid,
        "issuer": token.issuer(),
        "subject": token.subject(),
        "token_identifier": if claims.jti.is_some() { "jti" } else { "signature" },
        "jti": claims.jti,
        "azp": claims.azp,
        "scopes": scopes,
        "exp": claims.exp,
        "nbf": claims.nbf,
    }))
}

pub(crate) fn verify(
    config: &AuthConfig,
    raw: &str,
    method: &Method,
    path: &str,
    scopes: &[String],
    organization: Option<&str>,
    tenants: &[(String, i32)],
) -> Result<AuthOutcome> {
    let routes = Arc::new(InMemoryRouteMetadata::new());
    routes.register(
        "",
        "",
        UriTemplate::new(method.clone(), path, scopes.iter().cloned())
            .with_context(|| format!("invalid path template '{}'", path))?,
    );
    let realm = Arc::new(InMemoryRealm::new());
    for (domain, id) in tenants {
        realm.add_tenant(domain, *id);
    }
    let authenticator = config
        .authenticator_builder(config.issuer_resolver()?, routes, realm)?
        .build();

    let mut headers = HeaderMap::new();
    let value = HeaderValue::from_str(&format!("Bearer {}", raw.trim()))
        .context("token contains characters not allowed in a header")?;
    headers.insert(AUTHORIZATION, value);

    let mut request = AuthRequest::new(&headers, method, path);
    if let Some(org) = organization {
        request = request.organization(org);
    }
    Ok(authenticator.authenticate(&request)?)
}

pub(crate) fn outcome_json(outcome: &AuthOutcome) -> Value {
    match outcome {
        AuthOutcome::Authenticated(context) => json!({
            "authenticated": true,
            "context": context,
        }),
        AuthOutcome::Rejected(reason) => json!({
            "authenticated": false,
            "reason": reason.label(),
            "detail": reason.to_string(),
        }),
    }
}
