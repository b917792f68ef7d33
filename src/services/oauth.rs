use std::collections::HashMap;

use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

use crate::catalog::find_catalog_entry;
use crate::datastore::DataStore;
use crate::models::integration::Integration;

#[derive(Error, Debug)]
pub enum OAuthError {
    #[error("integration {0} not found")]
    IntegrationNotFound(String),
    #[error("integration {0} is missing OAuth client credentials")]
    MissingClientCredentials(String),
    #[error("token endpoint answered {status}: {body}")]
    TokenEndpoint { status: u16, body: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("datastore error: {0}")]
    Datastore(#[from] crate::datastore::DatastoreError),
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// True when the integration's access token is within five minutes of
/// expiry. Missing expiry metadata reads as not expired.
pub fn is_token_expired(integration: &Integration) -> bool {
    integration.is_token_expired(OffsetDateTime::now_utc())
}

/// Authorization header map for an OAuth integration; empty when no token
/// is present.
pub fn build_oauth_headers(integration: &Integration) -> HashMap<String, String> {
    match integration.access_token() {
        Some(token) if !token.is_empty() => HashMap::from([(
            "Authorization".to_string(),
            format!("{} {}", integration.token_type(), token),
        )]),
        _ => HashMap::new(),
    }
}

/// The token endpoint for an integration: explicit `token_url` credential,
/// then the catalog entry for the integration, then `{urlHost}/oauth/token`.
pub fn resolve_token_url(integration: &Integration) -> String {
    if let Some(url) = integration.credentials.get("token_url") {
        if !url.trim().is_empty() {
            return url.clone();
        }
    }
    if let Some(entry) = find_catalog_entry(&integration.id)
        .or_else(|| crate::catalog::find_catalog_entry_for_url(&integration.url_host))
    {
        if let Some(oauth) = &entry.oauth {
            return oauth.token_url.to_string();
        }
    }
    format!("{}/oauth/token", integration.url_host.trim_end_matches('/'))
}

/// Exchanges the refresh token for a new access token and updates the
/// integration's credentials in place. Returns false (and logs) on any
/// failure so callers can proceed with the stale token.
pub async fn refresh_oauth_token(client: &Client, integration: &mut Integration) -> bool {
    match try_refresh(client, integration).await {
        Ok(()) => true,
        Err(err) => {
            warn!(
                integration_id = %integration.id,
                %err,
                "oauth token refresh failed"
            );
            false
        }
    }
}

async fn try_refresh(client: &Client, integration: &mut Integration) -> Result<(), OAuthError> {
    let refresh_token = integration
        .refresh_token()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| OAuthError::MissingClientCredentials(integration.id.clone()))?
        .to_string();
    let client_id = integration
        .credentials
        .get("client_id")
        .cloned()
        .unwrap_or_default();
    let client_secret = integration
        .credentials
        .get("client_secret")
        .cloned()
        .unwrap_or_default();

    let token_url = resolve_token_url(integration);
    debug!(integration_id = %integration.id, %token_url, "refreshing oauth token");

    let form = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token.as_str()),
        ("client_id", client_id.as_str()),
        ("client_secret", client_secret.as_str()),
    ];

    let response = client.post(&token_url).form(&form).send().await?;
    let status = response.status().as_u16();
    if !(200..300).contains(&status) {
        let body = response.text().await.unwrap_or_default();
        return Err(OAuthError::TokenEndpoint { status, body });
    }

    let tokens: TokenResponse = response.json().await?;
    apply_token_response(integration, tokens, OffsetDateTime::now_utc());
    Ok(())
}

fn apply_token_response(integration: &mut Integration, tokens: TokenResponse, now: OffsetDateTime) {
    integration
        .credentials
        .insert("access_token".to_string(), tokens.access_token);
    if let Some(refresh) = tokens.refresh_token {
        integration
            .credentials
            .insert("refresh_token".to_string(), refresh);
    }
    if let Some(token_type) = tokens.token_type {
        integration
            .credentials
            .insert("token_type".to_string(), token_type);
    }
    if let Some(expires_in) = tokens.expires_in {
        let expires_at = now + Duration::seconds(expires_in);
        if let Ok(rendered) = expires_at.format(&Rfc3339) {
            integration
                .credentials
                .insert("expires_at".to_string(), rendered);
        }
    }
}

/// Authorization-code exchange for the OAuth callback: swaps the code for
/// tokens and persists the updated integration.
pub async fn handle_oauth_callback(
    client: &Client,
    store: &dyn DataStore,
    org_id: &str,
    integration_id: &str,
    code: &str,
    redirect_uri: &str,
) -> Result<Integration, OAuthError> {
    let mut integration = store
        .get_integration(org_id, integration_id)
        .await?
        .ok_or_else(|| OAuthError::IntegrationNotFound(integration_id.to_string()))?;

    let client_id = integration
        .credentials
        .get("client_id")
        .cloned()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| OAuthError::MissingClientCredentials(integration_id.to_string()))?;
    let client_secret = integration
        .credentials
        .get("client_secret")
        .cloned()
        .unwrap_or_default();

    let token_url = resolve_token_url(&integration);
    let form = [
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("client_id", client_id.as_str()),
        ("client_secret", client_secret.as_str()),
    ];

    let response = client.post(&token_url).form(&form).send().await?;
    let status = response.status().as_u16();
    if !(200..300).contains(&status) {
        let body = response.text().await.unwrap_or_default();
        return Err(OAuthError::TokenEndpoint { status, body });
    }

    let tokens: TokenResponse = response.json().await?;
    apply_token_response(&mut integration, tokens, OffsetDateTime::now_utc());
    store.upsert_integration(org_id, &integration).await?;
    Ok(integration)
}
