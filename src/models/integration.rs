use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};

/// A registered third-party API: URL patterns, credentials, and the
/// documentation the self-healing loop searches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Integration {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url_host: String,
    #[serde(default)]
    pub url_path: String,
    /// Opaque credential map; encrypted at rest by the datastore.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub credentials: HashMap<String, String>,
    #[serde(default)]
    pub documentation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_api_schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specific_instructions: Option<String>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub created_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub updated_at: Option<OffsetDateTime>,
}

impl Integration {
    pub fn access_token(&self) -> Option<&str> {
        self.credentials.get("access_token").map(|s| s.as_str())
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.credentials.get("refresh_token").map(|s| s.as_str())
    }

    pub fn token_type(&self) -> &str {
        self.credentials
            .get("token_type")
            .map(|s| s.as_str())
            .unwrap_or("Bearer")
    }

    /// `expires_at` as a timestamp, if present and well-formed ISO-8601.
    pub fn token_expires_at(&self) -> Option<OffsetDateTime> {
        let raw = self.credentials.get("expires_at")?;
        OffsetDateTime::parse(raw, &Rfc3339).ok()
    }

    /// True when the access token expires within five minutes. Missing or
    /// unparseable expiry reads as not expired.
    pub fn is_token_expired(&self, now: OffsetDateTime) -> bool {
        match self.token_expires_at() {
            Some(expires_at) => expires_at <= now + Duration::minutes(5),
            None => false,
        }
    }

    /// All non-empty credential values, used for masking.
    pub fn secret_values(&self) -> Vec<String> {
        self.credentials
            .values()
            .filter(|v| !v.trim().is_empty())
            .cloned()
            .collect()
    }
}
