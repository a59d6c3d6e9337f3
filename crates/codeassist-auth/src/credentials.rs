//! Credential token files
//!
//! Each account owns one JSON token file (camelCase keys, 2-space indent)
//! holding the access/refresh token pair, the absolute expiry, and (for
//! IdC accounts) the registered client pair. All writes are atomic
//! (temp file + rename, 0600 permissions) to prevent corruption on crash.
//!
//! IdC device registrations may store only a `clientIdHash`; the full
//! `clientId`/`clientSecret` then live in a sibling file named
//! `{clientIdHash}.json` in the same directory. The merge happens once at
//! load time; consumers see an immutable, fully-populated value.

use std::path::Path;
use std::time::Duration;

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// How the credential was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// Identity-center device registration (carries a client id/secret pair)
    Idc,
    /// Social login (builder-id style; no client pair)
    #[default]
    Social,
}

/// A single account's credentials as persisted in its token file.
///
/// `expires_at` is a unix timestamp in milliseconds (absolute, not a delta).
/// The token and secret fields live behind `Secret`, so formatting a
/// credential (derived `Debug` included) prints `[REDACTED]` while serde
/// still round-trips the real bytes through the token file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub access_token: Secret<String>,
    #[serde(default)]
    pub refresh_token: Secret<String>,
    /// Expiration as unix timestamp in milliseconds
    #[serde(default)]
    pub expires_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<Secret<String>>,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub auth_method: AuthMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id_hash: Option<String>,
}

/// Sibling file holding the registered IdC client pair, keyed by hash.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientRegistration {
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    client_secret: Option<Secret<String>>,
}

impl Credential {
    /// Load a credential from its token file, merging the sibling
    /// `{clientIdHash}.json` registration when the client pair is split out.
    ///
    /// A missing or unreadable sibling is not an error: the credential is
    /// returned as-is and the refresh path will report the incomplete pair.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Io(format!("reading token file {}: {e}", path.display())))?;
        let mut credential: Credential = serde_json::from_str(&contents)
            .map_err(|e| Error::CredentialParse(format!("parsing token file: {e}")))?;

        if credential.client_id.is_none() {
            if let Some(hash) = credential.client_id_hash.clone() {
                credential.merge_client_registration(path, &hash).await;
            }
        }

        Ok(credential)
    }

    async fn merge_client_registration(&mut self, token_path: &Path, hash: &str) {
        let Some(dir) = token_path.parent() else {
            return;
        };
        let sibling = dir.join(format!("{hash}.json"));
        let Ok(contents) = tokio::fs::read_to_string(&sibling).await else {
            return;
        };
        let Ok(registration) = serde_json::from_str::<ClientRegistration>(&contents) else {
            debug!(path = %sibling.display(), "unparseable client registration, skipping merge");
            return;
        };
        if self.client_id.is_none() {
            self.client_id = registration.client_id;
        }
        if self.client_secret.is_none() {
            self.client_secret = registration.client_secret;
        }
    }

    /// Persist to the token file atomically with 0600 permissions.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::CredentialParse(format!("serializing credential: {e}")))?;
        common::fs::write_atomic_secret(path, json.as_bytes())
            .await
            .map_err(|e| Error::Io(format!("writing token file {}: {e}", path.display())))?;
        debug!(path = %path.display(), "persisted credential");
        Ok(())
    }

    /// Whether the access token has passed its expiry.
    pub fn is_expired(&self, now_millis: u64) -> bool {
        now_millis >= self.expires_at
    }

    /// Whether the access token expires within `window` from `now_millis`.
    pub fn expires_within(&self, window: Duration, now_millis: u64) -> bool {
        self.expires_at <= now_millis + window.as_millis() as u64
    }

    /// IdC credentials need the full client pair to refresh.
    pub fn has_client_pair(&self) -> bool {
        self.client_id.is_some() && self.client_secret.is_some()
    }
}

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_credential() -> Credential {
        Credential {
            access_token: "at_test".into(),
            refresh_token: "rt_test".into(),
            expires_at: 4_102_444_800_000,
            client_id: None,
            client_secret: None,
            region: "us-east-1".into(),
            auth_method: AuthMethod::Social,
            profile_arn: None,
            client_id_hash: None,
        }
    }

    #[tokio::test]
    async fn roundtrip_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");

        let credential = test_credential();
        credential.save(&path).await.unwrap();

        let loaded = Credential::load(&path).await.unwrap();
        assert_eq!(loaded.access_token.expose(), "at_test");
        assert_eq!(loaded.refresh_token.expose(), "rt_test");
        assert_eq!(loaded.expires_at, 4_102_444_800_000);
        assert_eq!(loaded.auth_method, AuthMethod::Social);
    }

    #[test]
    fn debug_never_prints_token_material() {
        let credential = test_credential();
        let debug = format!("{credential:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("at_test"));
        assert!(!debug.contains("rt_test"));
    }

    #[tokio::test]
    async fn file_uses_camel_case_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");

        test_credential().save(&path).await.unwrap();

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(raw.contains("\"accessToken\""));
        assert!(raw.contains("\"refreshToken\""));
        assert!(raw.contains("\"expiresAt\""));
        assert!(raw.contains("\"authMethod\""));
        // 2-space indented pretty output
        assert!(raw.contains("\n  \"accessToken\""));
    }

    #[tokio::test]
    async fn idc_merge_from_sibling_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");

        let mut credential = test_credential();
        credential.auth_method = AuthMethod::Idc;
        credential.client_id_hash = Some("abc123".into());
        credential.save(&path).await.unwrap();

        tokio::fs::write(
            dir.path().join("abc123.json"),
            r#"{"clientId": "cid", "clientSecret": "csec"}"#,
        )
        .await
        .unwrap();

        let loaded = Credential::load(&path).await.unwrap();
        assert_eq!(loaded.client_id.as_deref(), Some("cid"));
        assert_eq!(
            loaded.client_secret.as_ref().map(|s| s.expose().as_str()),
            Some("csec")
        );
        assert!(loaded.has_client_pair());
    }

    #[tokio::test]
    async fn missing_sibling_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");

        let mut credential = test_credential();
        credential.client_id_hash = Some("nope".into());
        credential.save(&path).await.unwrap();

        let loaded = Credential::load(&path).await.unwrap();
        assert!(loaded.client_id.is_none());
        assert!(!loaded.has_client_pair());
    }

    #[tokio::test]
    async fn inline_client_pair_wins_over_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");

        let mut credential = test_credential();
        credential.client_id = Some("inline".into());
        credential.client_id_hash = Some("abc123".into());
        credential.save(&path).await.unwrap();

        tokio::fs::write(
            dir.path().join("abc123.json"),
            r#"{"clientId": "from-sibling", "clientSecret": "s"}"#,
        )
        .await
        .unwrap();

        let loaded = Credential::load(&path).await.unwrap();
        assert_eq!(loaded.client_id.as_deref(), Some("inline"));
    }

    #[tokio::test]
    async fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let err = Credential::load(&path).await.unwrap_err();
        assert!(matches!(err, Error::CredentialParse(_)));
    }

    #[test]
    fn expiry_predicates() {
        let mut credential = test_credential();
        credential.expires_at = 1_000_000;

        assert!(!credential.is_expired(999_999));
        assert!(credential.is_expired(1_000_000));
        assert!(credential.is_expired(1_000_001));

        // expires within 300s of now = 700_001 (700_001 + 300_000 > 1_000_000)
        assert!(credential.expires_within(Duration::from_secs(300), 700_001));
        assert!(!credential.expires_within(Duration::from_secs(300), 699_999));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn token_file_is_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        test_credential().save(&path).await.unwrap();

        let mode = tokio::fs::metadata(&path)
            .await
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o600);
    }
}
