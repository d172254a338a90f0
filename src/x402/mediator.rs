//! Payment mediation: inbound admission and outbound forwarding policy
//!
//! The mediator decides, per call, whether the gateway admits the request
//! for free, accepts an offered payment, challenges with payment
//! requirements, or rejects it. On the forwarding side it tells the
//! dispatcher which headers to copy and whether the gateway's own wallet
//! should answer a downstream challenge.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::facilitator::Facilitator;
use super::network::Network;
use super::types::{
    HeaderBag, InboundAuth, Markup, Money, PASSTHROUGH_HEADERS, PaymentRequirements,
};
use super::wallet::OutboundWallet;

/// What kind of capability a call targets. Decides the challenge resource
/// path and description wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Tool,
    Resource,
    Prompt,
}

impl EntryKind {
    pub fn path_segment(&self) -> &'static str {
        match self {
            EntryKind::Tool => "tools",
            EntryKind::Resource => "resources",
            EntryKind::Prompt => "prompts",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EntryKind::Tool => "tool",
            EntryKind::Resource => "resource",
            EntryKind::Prompt => "prompt",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            EntryKind::Tool => "Tool",
            EntryKind::Resource => "Resource",
            EntryKind::Prompt => "Prompt",
        }
    }
}

// ============================================================================
// Policy configuration
// ============================================================================

/// How the gateway treats payments when forwarding to one upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMode {
    /// No payment handling; forward as-is.
    #[default]
    None,
    /// Copy the client's payment headers through verbatim.
    Passthrough,
    /// Gateway pays the downstream and re-prices for its clients.
    Markup,
    /// Gateway pays the downstream; inbound pricing is set independently.
    Absorb,
}

/// Per-entity pricing descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pricing {
    #[serde(default)]
    pub free: bool,

    /// x402 price, e.g. `"$0.01"`.
    #[serde(default)]
    pub x402: Option<Money>,

    /// Tier label to price; `"free"` (or a zero amount) bypasses payment.
    #[serde(default, rename = "apiKeyTiers")]
    pub api_key_tiers: Option<HashMap<String, String>>,
}

/// Per-upstream payment policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamPaymentPolicy {
    #[serde(default)]
    pub mode: PaymentMode,

    /// Only meaningful when `mode = markup`.
    #[serde(default)]
    pub markup: Option<Markup>,

    #[serde(default, rename = "defaultPricing")]
    pub default_pricing: Option<Pricing>,

    /// Keyed by the upstream's original tool name (or resource URI).
    #[serde(default, rename = "perTool")]
    pub per_tool: Option<HashMap<String, Pricing>>,
}

/// A static API key credential mapped to a pricing tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyEntry {
    pub key: String,
    pub tier: String,
    /// Parsed for config completeness; enforcement is not specified.
    #[serde(default, rename = "rateLimit")]
    pub rate_limit: Option<u32>,
}

/// Gateway-wide payment policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentPolicy {
    #[serde(default)]
    pub enabled: bool,

    /// Address that receives inbound payments.
    #[serde(default)]
    pub recipient: String,

    #[serde(default)]
    pub network: Network,

    #[serde(default, rename = "facilitatorUrl")]
    pub facilitator_url: Option<String>,

    /// Opaque credential enabling outbound payments when present.
    #[serde(default, rename = "outboundCredential")]
    pub outbound_credential: Option<String>,

    /// Per-call cap on what the gateway will pay a downstream.
    #[serde(default = "default_outbound_max", rename = "outboundMaxValue")]
    pub outbound_max_value: Money,

    #[serde(default, rename = "apiKeys")]
    pub api_keys: Vec<ApiKeyEntry>,
}

fn default_outbound_max() -> Money {
    Money::parse("$1.00").unwrap_or(Money::ZERO)
}

impl Default for PaymentPolicy {
    fn default() -> Self {
        PaymentPolicy {
            enabled: false,
            recipient: String::new(),
            network: Network::default(),
            facilitator_url: None,
            outbound_credential: None,
            outbound_max_value: default_outbound_max(),
            api_keys: Vec::new(),
        }
    }
}

// ============================================================================
// Decisions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentMethod {
    X402,
    ApiKey,
}

/// Result of inbound admission.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentOutcome {
    AllowFree,
    AllowPaid {
        method: PaymentMethod,
        amount: Money,
    },
    Challenge {
        requirements: PaymentRequirements,
    },
    /// Same surface as a challenge, but carrying the failure reason.
    Reject {
        reason: String,
        requirements: PaymentRequirements,
    },
}

/// How to augment the forwarded request.
#[derive(Debug, Clone)]
pub enum ForwardDirective {
    /// Forward without payment augmentation.
    Plain,
    /// Copy these inbound headers verbatim (original casing preserved).
    Passthrough(Vec<(String, String)>),
    /// The gateway's wallet answers a downstream 402 on this call.
    Pay(Arc<OutboundWallet>),
}

/// Client-facing price for a marked-up downstream price, rendered with six
/// decimal places.
pub fn compute_markup_price(downstream: &Money, markup: &Markup) -> String {
    markup.apply(downstream).render6()
}

// ============================================================================
// Mediator
// ============================================================================

/// Price fallback when a challenge is required but no x402 price is set.
const DEFAULT_CHALLENGE_PRICE: &str = "$0.01";

pub struct PaymentMediator<F> {
    policy: PaymentPolicy,
    /// key -> tier, immutable after construction
    api_key_index: HashMap<String, String>,
    facilitator: Option<F>,
    wallet: Option<Arc<OutboundWallet>>,
}

impl<F: Facilitator> PaymentMediator<F> {
    pub fn new(policy: PaymentPolicy, facilitator: Option<F>) -> Self {
        let api_key_index = policy
            .api_keys
            .iter()
            .map(|entry| (entry.key.clone(), entry.tier.clone()))
            .collect();
        let wallet = policy.outbound_credential.clone().map(|credential| {
            Arc::new(OutboundWallet::new(credential, policy.outbound_max_value))
        });
        PaymentMediator {
            policy,
            api_key_index,
            facilitator,
            wallet,
        }
    }

    pub fn policy(&self) -> &PaymentPolicy {
        &self.policy
    }

    /// Pricing for one entity: per-tool entry first, then the upstream
    /// default, then nothing (treated as free).
    pub fn resolve_pricing<'a>(
        policy: &'a UpstreamPaymentPolicy,
        original_name: &str,
    ) -> Option<&'a Pricing> {
        if let Some(per_tool) = &policy.per_tool
            && let Some(pricing) = per_tool.get(original_name)
        {
            return Some(pricing);
        }
        policy.default_pricing.as_ref()
    }

    /// Inbound admission: decide whether this call proceeds and on what
    /// terms.
    pub async fn admit(
        &self,
        kind: EntryKind,
        exposed_name: &str,
        upstream_policy: &UpstreamPaymentPolicy,
        original_name: &str,
        auth: &InboundAuth,
    ) -> PaymentOutcome {
        if !self.policy.enabled {
            return PaymentOutcome::AllowFree;
        }

        let pricing = match Self::resolve_pricing(upstream_policy, original_name) {
            Some(pricing) if !pricing.free => pricing,
            _ => return PaymentOutcome::AllowFree,
        };

        // API key first: local and cheap. An absent or unknown key, or a
        // known key without a matching tier price, falls through to the
        // X-PAYMENT check below.
        if let Some(key) = &auth.api_key
            && let Some(tier) = self.api_key_index.get(key)
            && let Some(tiers) = &pricing.api_key_tiers
            && let Some(tier_price) = tiers.get(tier)
        {
            if is_free_tier_price(tier_price) {
                return PaymentOutcome::AllowPaid {
                    method: PaymentMethod::ApiKey,
                    amount: Money::ZERO,
                };
            }
            if let Some(amount) = Money::parse(tier_price) {
                return PaymentOutcome::AllowPaid {
                    method: PaymentMethod::ApiKey,
                    amount,
                };
            }
            tracing::warn!(%tier, price = %tier_price, "Unparseable tier price, ignoring");
        }

        let Some(payload_bytes) = &auth.x402 else {
            return PaymentOutcome::Challenge {
                requirements: self.challenge(kind, exposed_name, pricing),
            };
        };

        let requirements = self.challenge(kind, exposed_name, pricing);

        let payload: serde_json::Value = match serde_json::from_slice(payload_bytes) {
            Ok(payload) => payload,
            Err(_) => {
                return PaymentOutcome::Reject {
                    reason: "invalid payment payload".to_string(),
                    requirements,
                };
            }
        };

        let Some(facilitator) = &self.facilitator else {
            tracing::error!("Payment policy enabled without a facilitator");
            return PaymentOutcome::Reject {
                reason: "payment verification unavailable".to_string(),
                requirements,
            };
        };

        let verdict = facilitator.verify(&payload, &requirements.accepts[0]).await;
        if verdict.verified {
            let amount = pricing
                .x402
                .unwrap_or_else(|| Money::parse(DEFAULT_CHALLENGE_PRICE).unwrap_or(Money::ZERO));
            PaymentOutcome::AllowPaid {
                method: PaymentMethod::X402,
                amount,
            }
        } else {
            // Facilitator details (including HTTP codes) stay in the logs.
            if let Some(error) = verdict.error {
                tracing::info!(error = %error, "Payment verification failed");
            }
            PaymentOutcome::Reject {
                reason: "payment verification failed".to_string(),
                requirements,
            }
        }
    }

    /// The challenge emitted when payment is required but not provided.
    pub fn challenge(
        &self,
        kind: EntryKind,
        exposed_name: &str,
        pricing: &Pricing,
    ) -> PaymentRequirements {
        let price = pricing
            .x402
            .map(|m| m.to_string())
            .unwrap_or_else(|| DEFAULT_CHALLENGE_PRICE.to_string());
        PaymentRequirements::exact(
            self.policy.network,
            &price,
            &self.policy.recipient,
            format!("/{}/{}", kind.path_segment(), exposed_name),
            format!("Payment for MCP {}: {}", kind.label(), exposed_name),
        )
    }

    /// Client-facing price for one entity, if it is priced at all. Under
    /// markup mode the configured x402 price is the downstream price and
    /// the markup is applied on top.
    pub fn published_price(
        &self,
        upstream_policy: &UpstreamPaymentPolicy,
        original_name: &str,
    ) -> Option<String> {
        if !self.policy.enabled {
            return None;
        }
        let pricing = Self::resolve_pricing(upstream_policy, original_name)?;
        if pricing.free {
            return None;
        }
        let base = pricing.x402?;
        match (upstream_policy.mode, &upstream_policy.markup) {
            (PaymentMode::Markup, Some(markup)) => Some(compute_markup_price(&base, markup)),
            _ => Some(base.to_string()),
        }
    }

    /// How the forwarded request is augmented for this upstream.
    pub fn forward_directive(
        &self,
        upstream_policy: &UpstreamPaymentPolicy,
        headers: &HeaderBag,
    ) -> ForwardDirective {
        match upstream_policy.mode {
            PaymentMode::None => ForwardDirective::Plain,
            PaymentMode::Passthrough => {
                ForwardDirective::Passthrough(headers.select(PASSTHROUGH_HEADERS))
            }
            PaymentMode::Markup | PaymentMode::Absorb => match &self.wallet {
                Some(wallet) => ForwardDirective::Pay(Arc::clone(wallet)),
                None => {
                    tracing::warn!(
                        "Upstream requires outbound payment but no outbound credential is configured"
                    );
                    ForwardDirective::Plain
                }
            },
        }
    }
}

fn is_free_tier_price(price: &str) -> bool {
    if price.trim().eq_ignore_ascii_case("free") {
        return true;
    }
    Money::parse(price).is_some_and(|m| m.is_zero())
}
