//! Core x402 value types: dollar amounts, markup specs, payment
//! requirements, and the inbound auth extracted from request headers.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as b64;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::network::Network;

/// USDC carries 6 decimals, so $1 = 1_000_000 atomic units.
const USDC_DECIMALS: u32 = 6;

/// Atomic-unit string used when a price cannot be parsed ($0.01).
const DEFAULT_ATOMIC: &str = "10000";

// ============================================================================
// Money
// ============================================================================

/// A non-negative dollar amount, parsed from strings like `"$0.01"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Money(pub Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    /// Parse a dollar string. Accepts an optional leading `$` and commas.
    /// Returns None for anything that is not a non-negative decimal.
    pub fn parse(s: &str) -> Option<Money> {
        let cleaned: String = s
            .trim()
            .trim_start_matches('$')
            .chars()
            .filter(|c| *c != ',' && !c.is_whitespace())
            .collect();
        let value = Decimal::from_str(&cleaned).ok()?;
        if value.is_sign_negative() {
            return None;
        }
        Some(Money(value))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Atomic USDC units: floor(dollars * 10^6), rendered as a decimal
    /// string with no leading zeros.
    pub fn atomic_units(&self) -> String {
        let scaled = self.0 * Decimal::from(10u64.pow(USDC_DECIMALS));
        match scaled.floor().to_u128() {
            Some(units) => units.to_string(),
            None => DEFAULT_ATOMIC.to_string(),
        }
    }

    /// Render with exactly six decimal places, e.g. `"$0.120000"`.
    pub fn render6(&self) -> String {
        format!("${:.6}", self.0.round_dp(USDC_DECIMALS))
    }
}

/// Atomic units for an arbitrary dollar string; malformed input defaults
/// to `"10000"` ($0.01).
pub fn atomic_units(s: &str) -> String {
    Money::parse(s)
        .map(|m| m.atomic_units())
        .unwrap_or_else(|| DEFAULT_ATOMIC.to_string())
}

impl Display for Money {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Money::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid dollar amount: {s:?}")))
    }
}

// ============================================================================
// Markup
// ============================================================================

/// Markup applied when re-pricing a paid downstream tool for inbound
/// clients: either a percentage (`"20%"`) or a fixed surcharge (`"$0.05"`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Markup {
    Percent(Decimal),
    Fixed(Money),
}

impl Markup {
    pub fn parse(s: &str) -> Option<Markup> {
        let s = s.trim();
        if let Some(pct) = s.strip_suffix('%') {
            let value = Decimal::from_str(pct.trim()).ok()?;
            if value.is_sign_negative() {
                return None;
            }
            return Some(Markup::Percent(value));
        }
        Money::parse(s).map(Markup::Fixed)
    }

    /// Client-facing price for a given downstream price, at 6-decimal
    /// precision.
    pub fn apply(&self, downstream: &Money) -> Money {
        let raw = match self {
            Markup::Percent(p) => downstream.0 * (Decimal::ONE + p / Decimal::from(100)),
            Markup::Fixed(f) => downstream.0 + f.0,
        };
        Money(raw.round_dp(USDC_DECIMALS))
    }
}

impl Display for Markup {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Markup::Percent(p) => write!(f, "{p}%"),
            Markup::Fixed(m) => write!(f, "{m}"),
        }
    }
}

impl Serialize for Markup {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Markup {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Markup::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid markup: {s:?}")))
    }
}

// ============================================================================
// Payment requirements (challenge shape)
// ============================================================================

/// One acceptable way to pay, as published in a 402 challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequirement {
    pub scheme: String,
    pub network: Network,
    #[serde(rename = "maxAmountRequired")]
    pub max_amount_required: String,
    pub resource: String,
    pub description: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    #[serde(rename = "payTo")]
    pub pay_to: String,
    #[serde(rename = "maxTimeoutSeconds")]
    pub max_timeout_seconds: u64,
    pub asset: String,
}

/// The full challenge body: protocol version plus the accepted payment
/// methods. Exactly one entry is emitted per challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequirements {
    #[serde(rename = "x402Version")]
    pub x402_version: u8,
    pub accepts: Vec<PaymentRequirement>,
}

impl PaymentRequirements {
    /// Build the single-entry challenge for a priced entity.
    pub fn exact(
        network: Network,
        price: &str,
        pay_to: &str,
        resource: String,
        description: String,
    ) -> Self {
        PaymentRequirements {
            x402_version: 1,
            accepts: vec![PaymentRequirement {
                scheme: "exact".to_string(),
                network,
                max_amount_required: atomic_units(price),
                resource,
                description,
                mime_type: "application/json".to_string(),
                pay_to: pay_to.to_string(),
                max_timeout_seconds: 30,
                asset: network.usdc_asset().to_string(),
            }],
        }
    }
}

// ============================================================================
// Inbound auth
// ============================================================================

const HEADER_X_PAYMENT: &str = "x-payment";
const HEADER_API_KEY: &str = "x-eliza-api-key";
const HEADER_AUTHORIZATION: &str = "authorization";

/// Request headers with original casing preserved, matched
/// case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct HeaderBag(Vec<(String, String)>);

impl HeaderBag {
    pub fn new(entries: Vec<(String, String)>) -> Self {
        HeaderBag(entries)
    }

    /// Build from a JSON object of string values (the `_meta.headers` form
    /// used on the streaming binding).
    pub fn from_json(value: &serde_json::Value) -> Self {
        let entries = value
            .as_object()
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        HeaderBag(entries)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Entries whose names match `names` (case-insensitive), original
    /// casing intact.
    pub fn select(&self, names: &[&str]) -> Vec<(String, String)> {
        self.0
            .iter()
            .filter(|(k, _)| names.iter().any(|n| k.eq_ignore_ascii_case(n)))
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, String)> {
        self.0.iter()
    }
}

/// Header names copied verbatim to the upstream in passthrough mode.
pub const PASSTHROUGH_HEADERS: &[&str] = &[HEADER_X_PAYMENT, HEADER_API_KEY, HEADER_AUTHORIZATION];

/// How the caller authenticated, computed once at the front-end boundary.
/// The API key and `X-PAYMENT` are independent signals: a request may
/// carry both, and admission checks the key first, then the payment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundAuth {
    /// From `X-ELIZA-API-KEY` or a bearer `Authorization` header.
    pub api_key: Option<String>,

    /// Decoded `X-PAYMENT` bytes. If the header was not valid base64 the
    /// raw bytes are kept so admission can reject with a precise reason.
    pub x402: Option<Vec<u8>>,
}

impl InboundAuth {
    pub fn anonymous() -> Self {
        InboundAuth::default()
    }

    pub fn is_anonymous(&self) -> bool {
        self.api_key.is_none() && self.x402.is_none()
    }

    pub fn from_headers(headers: &HeaderBag) -> Self {
        let api_key = headers
            .get(HEADER_API_KEY)
            .map(|key| key.to_string())
            .or_else(|| {
                let auth = headers.get(HEADER_AUTHORIZATION)?;
                let mut parts = auth.splitn(2, ' ');
                match (parts.next(), parts.next()) {
                    (Some(scheme), Some(token))
                        if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() =>
                    {
                        Some(token.trim().to_string())
                    }
                    _ => None,
                }
            });

        let x402 = headers.get(HEADER_X_PAYMENT).map(|xp| {
            b64.decode(xp.trim())
                .unwrap_or_else(|_| xp.as_bytes().to_vec())
        });

        InboundAuth { api_key, x402 }
    }
}
