//! Outbound auth-header application for forwarded requests and
//! availability probes (§3 `connectivityAuthType`, §4.1 step 6).
//!
//! Grounded on the teacher's `auth_utils.rs` (`AuthStyle`/
//! `apply_auth()`), narrowed to drop the OAuth-always-Bearer branch (no
//! OAuth is in scope) and collapse the teacher's four-variant enum into
//! the three forms `connectivityAuthType` actually takes.

use crate::provider::{AuthType, Provider};
use reqwest::RequestBuilder;

/// Apply `provider`'s auth type to an outbound request builder. Gemini
/// additionally always sets `x-goog-api-key` regardless of the
/// configured style, per §4.1 step 6 ("for Gemini specifically, set
/// `x-goog-api-key`").
pub fn apply_provider_auth(mut builder: RequestBuilder, provider: &Provider) -> RequestBuilder {
    match &provider.connectivity_auth_type {
        AuthType::Bearer => {
            builder = builder.header("Authorization", format!("Bearer {}", provider.api_key));
        }
        AuthType::XApiKey => {
            builder = builder.header("x-api-key", &provider.api_key);
        }
        AuthType::Header(name) => {
            builder = builder.header(name, &provider.api_key);
        }
    }
    builder
}

pub fn apply_gemini_auth(builder: RequestBuilder, provider: &Provider) -> RequestBuilder {
    builder.header("x-goog-api-key", &provider.api_key)
}
