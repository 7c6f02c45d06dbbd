//! HTTP publisher: signs a short-lived token per request and POSTs the
//! payload to the relay's publish API.
//!
//! The configuration is parsed and validated once at startup; nothing is
//! re-derived per request. Payload and target are explicit arguments — the
//! publisher has no implicit default message.

use hrp_common::report::DeliveryReport;
use hrp_common::token::{self, Claims};
use hrp_common::types::PublishTarget;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::config::ClientConfig;

/// Validates that the API URL has a supported scheme and a host.
fn validate_api_url(url: &str) -> anyhow::Result<()> {
    let parsed = url.parse::<reqwest::Url>()?;

    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        anyhow::bail!("api URL scheme must be http or https, got: {}", scheme);
    }

    if parsed.host_str().is_none() {
        anyhow::bail!("api URL must have a host");
    }

    Ok(())
}

/// Publisher half of the client: typed endpoint + signing key, built once.
#[derive(Debug)]
pub struct Publisher {
    http: Client,
    endpoint: String,
    hub: String,
    secret: Vec<u8>,
    token_ttl: Duration,
}

impl Publisher {
    /// Builds a publisher from the client configuration, failing fast on a
    /// malformed endpoint or a missing secret.
    ///
    /// # Errors
    ///
    /// Returns an error if the API URL is invalid or no secret is configured.
    pub fn from_config(config: &ClientConfig) -> anyhow::Result<Self> {
        validate_api_url(&config.api)?;
        let Some(secret) = &config.secret else {
            anyhow::bail!("publishing requires a shared secret in the configuration");
        };

        Ok(Self {
            http: Client::builder()
                .redirect(reqwest::redirect::Policy::limited(5))
                .timeout(Duration::from_secs(30))
                .build()?,
            endpoint: config.api.trim_end_matches('/').to_string(),
            hub: config.hub.clone(),
            secret: secret.clone().into_bytes(),
            token_ttl: Duration::from_secs(config.token_ttl_s),
        })
    }

    /// Publishes a payload to the given target.
    ///
    /// Returns the relay's delivery report; partial or total delivery
    /// failure is a reportable outcome, not an error. Only transport and
    /// authentication problems fail the call itself.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be signed or sent, or the
    /// relay answers with anything other than a delivery report.
    pub async fn publish(
        &self,
        target: &PublishTarget,
        payload: &Value,
    ) -> anyhow::Result<DeliveryReport> {
        let resource = target.resource_path(&self.hub);
        let claims = Claims {
            aud: resource.clone(),
            sub: None,
            exp: token::unix_now() + self.token_ttl.as_secs(),
        };
        let bearer = token::sign(&claims, &self.secret)?;
        let url = format!("{}{}", self.endpoint, resource);

        debug!(%url, kind = target.kind(), "sending publish request");
        let response = self
            .http
            .post(&url)
            .bearer_auth(&bearer)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        // 502 still carries a delivery report: all targets failed, which is
        // a valid aggregate outcome for a best-effort push.
        if status.is_success() || status == reqwest::StatusCode::BAD_GATEWAY {
            let report: DeliveryReport = response.json().await?;
            return Ok(report);
        }

        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("publish rejected: {status} {body}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;

    fn config_with_secret() -> ClientConfig {
        ClientConfig {
            secret: Some("a-shared-secret-that-is-long-enough!".to_string()),
            ..ClientConfig::default()
        }
    }

    #[test]
    fn from_config_requires_a_secret() {
        let config = ClientConfig::default();
        assert!(Publisher::from_config(&config)
            .unwrap_err()
            .to_string()
            .contains("secret"));
    }

    #[test]
    fn from_config_accepts_valid_settings() {
        assert!(Publisher::from_config(&config_with_secret()).is_ok());
    }

    #[test]
    fn from_config_rejects_bad_scheme() {
        let config = ClientConfig {
            api: "ftp://example.com".to_string(),
            ..config_with_secret()
        };
        assert!(Publisher::from_config(&config).is_err());
    }

    #[test]
    fn endpoint_trailing_slash_is_trimmed() {
        let config = ClientConfig {
            api: "http://127.0.0.1:9090/".to_string(),
            ..config_with_secret()
        };
        let publisher = Publisher::from_config(&config).unwrap();
        assert_eq!(publisher.endpoint, "http://127.0.0.1:9090");
    }

    #[test]
    fn validate_api_url_requires_host() {
        assert!(validate_api_url("http://").is_err());
        assert!(validate_api_url("not a url").is_err());
        assert!(validate_api_url("http://localhost:9090").is_ok());
    }
}
