//! Secret handling utilities.
//!
//! Re-exports secrecy types and provides helpers for working with
//! connection strings that may embed credentials.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

/// Render a database URL for logs with any password replaced.
pub fn redacted_url(url: &SecretString) -> String {
    let raw = url.expose_secret();
    let Some((scheme, rest)) = raw.split_once("://") else {
        return raw.to_string();
    };
    match rest.split_once('@') {
        Some((userinfo, host)) => {
            let user = userinfo.split(':').next().unwrap_or_default();
            format!("{scheme}://{user}:***@{host}")
        }
        None => raw.to_string(),
    }
}
