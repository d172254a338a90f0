//! Core trait and HTTP client for x402 payment facilitators
//!
//! The facilitator is an external service that checks a payment payload
//! against stated requirements. The gateway only needs its verdict; all
//! on-chain semantics live on the facilitator side.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use url::Url;

use super::types::PaymentRequirement;

/// Default timeout for facilitator round-trips.
const VERIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of a verification round-trip. Transport and protocol failures
/// are folded into `verified = false` so callers only branch on the verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub verified: bool,
    pub error: Option<String>,
}

impl Verdict {
    pub fn verified() -> Self {
        Verdict { verified: true, error: None }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Verdict { verified: false, error: Some(error.into()) }
    }
}

/// Asynchronous interface to an x402 facilitator.
pub trait Facilitator: Send + Sync {
    /// Check `payload` against `requirements` and return the verdict.
    fn verify(
        &self,
        payload: &Value,
        requirements: &PaymentRequirement,
    ) -> impl Future<Output = Verdict> + Send;
}

impl<T: Facilitator> Facilitator for Arc<T> {
    fn verify(
        &self,
        payload: &Value,
        requirements: &PaymentRequirement,
    ) -> impl Future<Output = Verdict> + Send {
        self.as_ref().verify(payload, requirements)
    }
}

/// Errors constructing a [`FacilitatorClient`].
#[derive(Debug, thiserror::Error)]
pub enum FacilitatorClientError {
    #[error("invalid facilitator URL: {0}")]
    UrlParse(#[source] url::ParseError),
}

/// HTTP client for a remote facilitator's `/verify` endpoint.
#[derive(Clone, Debug)]
pub struct FacilitatorClient {
    verify_url: Url,
    client: reqwest::Client,
}

/// Facilitators respond with either `verified` or the older `isValid` key.
#[derive(Deserialize)]
struct VerifyResponseBody {
    #[serde(default)]
    verified: Option<bool>,
    #[serde(default, rename = "isValid")]
    is_valid: Option<bool>,
    #[serde(default)]
    error: Option<String>,
}

impl FacilitatorClient {
    /// Build a client for `base_url`, normalizing a missing trailing slash
    /// so `/verify` joins correctly.
    pub fn try_new(base_url: &str) -> Result<Self, FacilitatorClientError> {
        let mut normalized = base_url.trim_end_matches('/').to_string();
        normalized.push('/');
        let base = Url::parse(&normalized).map_err(FacilitatorClientError::UrlParse)?;
        let verify_url = base
            .join("./verify")
            .map_err(FacilitatorClientError::UrlParse)?;
        Ok(FacilitatorClient {
            verify_url,
            client: reqwest::Client::new(),
        })
    }

    async fn post_verify(&self, payload: &Value, requirements: &PaymentRequirement) -> Verdict {
        let body = serde_json::json!({
            "paymentPayload": payload,
            "paymentRequirements": requirements,
        });

        let response = match self
            .client
            .post(self.verify_url.clone())
            .timeout(VERIFY_TIMEOUT)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "Facilitator request failed");
                return Verdict::rejected(format!("facilitator unreachable: {e}"));
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Verdict::rejected(format!("HTTP {}", status.as_u16()));
        }

        match response.json::<VerifyResponseBody>().await {
            Ok(body) => {
                let verified = body.verified.or(body.is_valid).unwrap_or(false);
                if verified {
                    Verdict::verified()
                } else {
                    Verdict {
                        verified: false,
                        error: body.error,
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Facilitator returned an unparseable body");
                Verdict { verified: false, error: None }
            }
        }
    }
}

impl Facilitator for FacilitatorClient {
    async fn verify(&self, payload: &Value, requirements: &PaymentRequirement) -> Verdict {
        self.post_verify(payload, requirements).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_normalization() {
        let client = FacilitatorClient::try_new("https://facilitator.example.com").unwrap();
        assert_eq!(
            client.verify_url.as_str(),
            "https://facilitator.example.com/verify"
        );

        let client = FacilitatorClient::try_new("https://facilitator.example.com/x402/").unwrap();
        assert_eq!(
            client.verify_url.as_str(),
            "https://facilitator.example.com/x402/verify"
        );
    }

    #[test]
    fn invalid_url_is_rejected() {
        assert!(FacilitatorClient::try_new("not a url").is_err());
    }

    #[test]
    fn verify_body_accepts_both_verdict_keys() {
        let body: VerifyResponseBody = serde_json::from_str(r#"{"verified": true}"#).unwrap();
        assert_eq!(body.verified, Some(true));

        let body: VerifyResponseBody =
            serde_json::from_str(r#"{"isValid": true, "payer": "0xabc"}"#).unwrap();
        assert_eq!(body.is_valid, Some(true));
    }
}
