//! API-key redaction for logs: every provider has an "API key
//! (opaque secret string; never logged)" per the provider entity's
//! invariants, so any place that might log a header value, a config
//! field, or an error message derived from one runs it through here
//! first.

use std::fmt;

/// A redacted view of an API key: the first 8 characters followed by
/// `***`, short enough to distinguish providers in a log line without
/// reproducing the secret.
#[derive(Clone, Debug)]
pub struct SensitiveApiKey<'a> {
    inner: &'a str,
}

impl<'a> SensitiveApiKey<'a> {
    pub fn new(key: &'a str) -> Self {
        Self { inner: key }
    }
}

impl<'a> fmt::Display for SensitiveApiKey<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let visible_len = 8.min(self.inner.len());
        if self.inner.len() <= visible_len {
            write!(f, "***")
        } else {
            write!(f, "{}***", &self.inner[..visible_len])
        }
    }
}

/// Does `value` look like an API key or bearer token, rather than an
/// ordinary identifier like a provider name?
pub fn is_sensitive_key(value: &str) -> bool {
    let sensitive_prefixes = [
        "sk-ant-",
        "sk-",
        "pk-",
        "sess-",
        "acct-",
        "Bearer sk-",
        "Bearer pk-",
    ];

    sensitive_prefixes.iter().any(|prefix| value.starts_with(prefix))
}

/// Redact `value` if it looks sensitive; pass it through unchanged
/// otherwise (provider names, platform tags, and the like).
pub fn sanitize_log_value(value: &str) -> String {
    if is_sensitive_key(value) {
        SensitiveApiKey::new(value).to_string()
    } else {
        value.to_string()
    }
}
