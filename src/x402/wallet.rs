//! Outbound payment synthesis from the gateway-owned credential
//!
//! When a downstream upstream answers a forwarded call with a 402
//! challenge, the transport layer asks this wallet for a retry
//! `X-PAYMENT` header. The wallet enforces the outbound spend cap before
//! producing anything; the credential itself is opaque to the gateway and
//! is validated by the downstream facilitator.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as b64;
use serde_json::json;

use super::types::{Money, PaymentRequirement, PaymentRequirements};

/// Validity window opens this many seconds in the past to absorb clock skew.
const VALID_AFTER_SLACK_SECS: u64 = 600;

#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("downstream payment exceeds cap")]
    ExceedsCap,
    #[error("downstream challenge offers no payment methods")]
    EmptyChallenge,
    #[error("downstream challenge is malformed: {0}")]
    MalformedChallenge(String),
    #[error("failed to encode payment payload: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Holds the gateway's outbound credential and the per-call spend cap.
#[derive(Debug, Clone)]
pub struct OutboundWallet {
    credential: String,
    max_value: Money,
}

impl OutboundWallet {
    pub fn new(credential: String, max_value: Money) -> Self {
        OutboundWallet { credential, max_value }
    }

    pub fn max_value(&self) -> &Money {
        &self.max_value
    }

    /// A short payer reference derived from the credential, safe to log.
    pub fn payer_ref(&self) -> String {
        let tail: String = self
            .credential
            .chars()
            .rev()
            .take(6)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("mux402:…{tail}")
    }

    /// Parse a downstream challenge body into [`PaymentRequirements`].
    pub fn parse_challenge(data: &serde_json::Value) -> Result<PaymentRequirements, WalletError> {
        serde_json::from_value(data.clone())
            .map_err(|e| WalletError::MalformedChallenge(e.to_string()))
    }

    /// Check the cap against a specific requirement. Runs between the
    /// first send and signing: nothing is signed for an over-cap amount.
    pub fn check_cap(&self, requirement: &PaymentRequirement) -> Result<(), WalletError> {
        let requested: u128 = requirement
            .max_amount_required
            .parse()
            .map_err(|_| WalletError::MalformedChallenge(format!(
                "non-numeric maxAmountRequired: {:?}",
                requirement.max_amount_required
            )))?;
        let cap: u128 = self
            .max_value
            .atomic_units()
            .parse()
            .unwrap_or(0);
        if requested > cap {
            return Err(WalletError::ExceedsCap);
        }
        Ok(())
    }

    /// Produce the base64 `X-PAYMENT` header for the first accepted method
    /// of a downstream challenge. Fails before signing if the amount
    /// exceeds the configured cap.
    pub fn payment_header(
        &self,
        requirements: &PaymentRequirements,
    ) -> Result<String, WalletError> {
        let selected = requirements
            .accepts
            .first()
            .ok_or(WalletError::EmptyChallenge)?;
        self.check_cap(selected)?;

        let now = unix_now();
        let nonce = nonce_hex();

        // The authorization mirrors the exact-scheme shape; the credential
        // stands in for an on-chain signature, which the downstream
        // facilitator is responsible for validating.
        let payload = json!({
            "x402Version": requirements.x402_version,
            "scheme": selected.scheme,
            "network": selected.network,
            "payload": {
                "authorization": {
                    "from": self.payer_ref(),
                    "to": selected.pay_to,
                    "value": selected.max_amount_required,
                    "validAfter": now.saturating_sub(VALID_AFTER_SLACK_SECS).to_string(),
                    "validBefore": (now + selected.max_timeout_seconds).to_string(),
                    "nonce": nonce,
                },
                "signature": self.credential,
            },
        });

        let bytes = serde_json::to_vec(&payload).map_err(WalletError::Encode)?;
        Ok(b64.encode(bytes))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn nonce_hex() -> String {
    let bytes: [u8; 32] = rand::random();
    let mut out = String::with_capacity(66);
    out.push_str("0x");
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x402::network::Network;

    fn challenge(amount: &str) -> PaymentRequirements {
        PaymentRequirements {
            x402_version: 1,
            accepts: vec![PaymentRequirement {
                scheme: "exact".to_string(),
                network: Network::Base,
                max_amount_required: amount.to_string(),
                resource: "https://upstream.example.com/tool".to_string(),
                description: "paid tool".to_string(),
                mime_type: "application/json".to_string(),
                pay_to: "0xfeed".to_string(),
                max_timeout_seconds: 60,
                asset: Network::Base.usdc_asset().to_string(),
            }],
        }
    }

    fn wallet(cap: &str) -> OutboundWallet {
        OutboundWallet::new("cred-12345-secret".to_string(), Money::parse(cap).unwrap())
    }

    #[test]
    fn header_is_decodable_json() {
        let header = wallet("$1.00").payment_header(&challenge("10000")).unwrap();
        let bytes = b64.decode(header).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["x402Version"], 1);
        assert_eq!(value["scheme"], "exact");
        assert_eq!(value["network"], "base");
        assert_eq!(value["payload"]["authorization"]["value"], "10000");
        assert_eq!(value["payload"]["authorization"]["to"], "0xfeed");
    }

    #[test]
    fn cap_is_enforced_before_signing() {
        // $1.00 cap = 1_000_000 atomic units
        let result = wallet("$1.00").payment_header(&challenge("1000001"));
        assert!(matches!(result, Err(WalletError::ExceedsCap)));

        // Exactly at the cap is allowed
        assert!(wallet("$1.00").payment_header(&challenge("1000000")).is_ok());
    }

    #[test]
    fn empty_challenge_is_rejected() {
        let empty = PaymentRequirements { x402_version: 1, accepts: vec![] };
        assert!(matches!(
            wallet("$1.00").payment_header(&empty),
            Err(WalletError::EmptyChallenge)
        ));
    }

    #[test]
    fn garbage_amount_is_rejected() {
        let result = wallet("$1.00").payment_header(&challenge("a lot"));
        assert!(matches!(result, Err(WalletError::MalformedChallenge(_))));
    }

    #[test]
    fn nonces_are_unique_per_header() {
        let w = wallet("$1.00");
        let a = w.payment_header(&challenge("10")).unwrap();
        let b = w.payment_header(&challenge("10")).unwrap();
        let nonce = |h: &str| {
            let v: serde_json::Value =
                serde_json::from_slice(&b64.decode(h).unwrap()).unwrap();
            v["payload"]["authorization"]["nonce"].as_str().unwrap().to_string()
        };
        assert_ne!(nonce(&a), nonce(&b));
    }

    #[test]
    fn payer_ref_hides_credential() {
        let w = wallet("$1.00");
        assert!(!w.payer_ref().contains("cred-12345-secret"));
        assert!(w.payer_ref().starts_with("mux402:"));
    }
}
