//! Token refresh against the auth endpoint
//!
//! POSTs the stored refresh token (plus the IdC client pair when present)
//! to the configured token endpoint and returns the new token pair with a
//! delta expiry. The caller converts the delta to an absolute timestamp
//! when persisting the credential.

use serde::Deserialize;

use crate::credentials::{AuthMethod, Credential};
use crate::error::{Error, Result};

/// Response from the token endpoint.
///
/// `expires_in` is a delta in seconds from the response time.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

/// Refresh an access token using the credential's refresh token.
///
/// IdC credentials must carry their client pair (merged at load time);
/// refusing locally beats a guaranteed 400 from the endpoint.
/// 401/403 means the refresh token itself is rejected, surfaced as
/// `InvalidCredentials` so callers can mark the account unhealthy rather
/// than retry.
pub async fn refresh_credential(
    client: &reqwest::Client,
    endpoint: &str,
    credential: &Credential,
) -> Result<TokenResponse> {
    if credential.refresh_token.expose().is_empty() {
        return Err(Error::InvalidCredentials("no refresh token stored".into()));
    }
    if credential.auth_method == AuthMethod::Idc && !credential.has_client_pair() {
        return Err(Error::InvalidCredentials(
            "idc credential missing client id/secret pair".into(),
        ));
    }

    let mut form: Vec<(&str, &str)> = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", credential.refresh_token.expose()),
    ];
    if let Some(client_id) = credential.client_id.as_deref() {
        form.push(("client_id", client_id));
    }
    if let Some(client_secret) = credential.client_secret.as_ref() {
        form.push(("client_secret", client_secret.expose()));
    }

    let response = client
        .post(endpoint)
        .form(&form)
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }

        return Err(Error::TokenRefresh(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenRefresh(format!("invalid refresh response: {e}")))
}
