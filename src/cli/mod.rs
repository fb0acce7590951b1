//! # CLI Module
//!
//! Command-line front end of the `brrtauth` binary.
//!
//! ## Commands
//!
//! ### `inspect`
//!
//! Decode a token without verifying it and print its claims as JSON. The
//! token itself is only ever printed in masked form:
//!
//! ```bash
//! brrtauth inspect --token "$TOKEN"
//! ```
//!
//! ### `verify`
//!
//! Run the full authenticator against a config file's static token issuers,
//! for a single route:
//!
//! ```bash
//! brrtauth verify --config auth.yaml --token "$TOKEN" \
//!     --method GET --path /apis --scopes apim:api_view,apim:subscribe \
//!     --tenant acme.com=7
//! ```
//!
//! The outcome is printed as JSON. The exit status is `0` when the request
//! is authenticated, `1` when it is rejected and `2` on configuration or
//! infrastructure errors.
//!
//! The token may also be passed through `BRRTAUTH_TOKEN` to keep it out of
//! shell history.

mod commands;


pub use commands::{run_cli, Cli, Commands};
