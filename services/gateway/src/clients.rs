//! HTTP implementations of the provider traits
//!
//! One shared connection pool for upstream traffic and a separate client
//! with a 30-second timeout for auth-endpoint calls. All four capability
//! traits the core consumes are implemented here; nothing inside the pool
//! crate ever constructs a request itself.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use codeassist_auth::{Credential, now_millis};
use futures_util::TryStreamExt;
use provider::{
    ProviderError, RefreshedToken, Result, SummaryClient, TokenClient, UpstreamClient,
    UpstreamReply, UpstreamRequest, UsageClient, UsageInfo,
};
use serde::Deserialize;
use serde_json::json;

use crate::config::EndpointsConfig;

/// Auth endpoint calls get a hard deadline; upstream streams do not.
const AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Reqwest-backed provider clients.
pub struct HttpClients {
    http: reqwest::Client,
    auth_http: reqwest::Client,
    endpoints: EndpointsConfig,
}

impl HttpClients {
    pub fn new(endpoints: EndpointsConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            auth_http: reqwest::Client::builder()
                .timeout(AUTH_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            endpoints,
        }
    }
}

/// Usage endpoint response body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageResponse {
    #[serde(default)]
    subscription_title: String,
    #[serde(default)]
    usage_limit: f64,
    #[serde(default)]
    current_usage: f64,
    #[serde(default)]
    free_trial_limit: f64,
    #[serde(default)]
    free_trial_usage: f64,
    #[serde(default)]
    bonus_limit: f64,
    #[serde(default)]
    bonus_usage: f64,
}

impl TokenClient for HttpClients {
    fn refresh<'a>(
        &'a self,
        credential: &'a Credential,
    ) -> Pin<Box<dyn Future<Output = Result<RefreshedToken>> + Send + 'a>> {
        Box::pin(async move {
            let response = codeassist_auth::refresh_credential(
                &self.auth_http,
                &self.endpoints.token_url,
                credential,
            )
            .await
            .map_err(|e| match e {
                codeassist_auth::Error::Http(message) => ProviderError::Http(message),
                other => ProviderError::Invalid(other.to_string()),
            })?;

            Ok(RefreshedToken {
                access_token: response.access_token,
                refresh_token: response.refresh_token,
                expires_at: now_millis() + response.expires_in * 1000,
            })
        })
    }
}

impl UsageClient for HttpClients {
    fn fetch_usage<'a>(
        &'a self,
        credential: &'a Credential,
        machine_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<UsageInfo>> + Send + 'a>> {
        Box::pin(async move {
            let response = self
                .auth_http
                .get(&self.endpoints.usage_url)
                .bearer_auth(credential.access_token.expose())
                .header("x-machine-id", machine_id)
                .send()
                .await
                .map_err(|e| ProviderError::Http(format!("usage request failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| String::from("<no body>"));
                return Err(ProviderError::Endpoint {
                    status: status.as_u16(),
                    body,
                });
            }

            let usage: UsageResponse = response
                .json()
                .await
                .map_err(|e| ProviderError::Invalid(format!("usage response: {e}")))?;
            Ok(UsageInfo {
                subscription_title: usage.subscription_title,
                usage_limit: usage.usage_limit,
                current_usage: usage.current_usage,
                free_trial_limit: usage.free_trial_limit,
                free_trial_usage: usage.free_trial_usage,
                bonus_limit: usage.bonus_limit,
                bonus_usage: usage.bonus_usage,
            })
        })
    }
}

impl UpstreamClient for HttpClients {
    fn forward<'a>(
        &'a self,
        request: &'a UpstreamRequest,
        access_token: &'a str,
        machine_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamReply>> + Send + 'a>> {
        Box::pin(async move {
            let mut body = json!({
                "history": request.history,
                "userInput": request.user_content,
            });
            if let Some(model_id) = &request.model_id {
                body["modelId"] = json!(model_id);
            }

            let response = self
                .http
                .post(&self.endpoints.upstream_url)
                .bearer_auth(access_token)
                .header("x-machine-id", machine_id)
                .json(&body)
                .send()
                .await
                .map_err(|e| ProviderError::Http(format!("forward failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| String::from("<no body>"));
                return Ok(UpstreamReply::Failure {
                    status: status.as_u16(),
                    body,
                });
            }

            let stream = response
                .bytes_stream()
                .map_err(|e| std::io::Error::other(format!("upstream read: {e}")));
            Ok(UpstreamReply::Stream(Box::pin(stream)))
        })
    }
}

impl SummaryClient for HttpClients {
    fn summarize<'a>(
        &'a self,
        prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let response = self
                .http
                .post(&self.endpoints.summarizer_url)
                .json(&json!({"prompt": prompt}))
                .send()
                .await
                .map_err(|e| ProviderError::Http(format!("summarizer request failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| String::from("<no body>"));
                return Err(ProviderError::Endpoint {
                    status: status.as_u16(),
                    body,
                });
            }

            response
                .text()
                .await
                .map_err(|e| ProviderError::Invalid(format!("summary response: {e}")))
        })
    }
}
