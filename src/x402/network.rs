//! Networks the gateway accepts inbound payments on, and their USDC deployments

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Deserializer, Serialize};

/// Supported payment networks (EVM only).
#[derive(Debug, Hash, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Network {
    #[serde(rename = "base-sepolia")]
    BaseSepolia,
    #[serde(rename = "base")]
    Base,
    #[serde(rename = "ethereum")]
    Ethereum,
    #[serde(rename = "optimism")]
    Optimism,
    #[serde(rename = "polygon")]
    Polygon,
}

/// USDC ERC-20 deployments, 6 decimals everywhere.
const USDC_DEPLOYMENTS: &[(Network, &str)] = &[
    (Network::BaseSepolia, "0x036CbD53842c5426634e7929541eC2318f3dCF7e"),
    (Network::Base, "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
    (Network::Ethereum, "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"),
    (Network::Optimism, "0x0b2C639c533813f4Aa9D7837CAf62653d097Ff85"),
    (Network::Polygon, "0x3c499c542cEF5E3811e1192ce70d8cC03d5c3359"),
];

impl Network {
    /// All known variants, in config-name order
    pub fn variants() -> &'static [Network] {
        &[
            Network::BaseSepolia,
            Network::Base,
            Network::Ethereum,
            Network::Optimism,
            Network::Polygon,
        ]
    }

    /// Primary (kebab-case) name used on the wire and in config
    pub fn name(&self) -> &'static str {
        match self {
            Network::BaseSepolia => "base-sepolia",
            Network::Base => "base",
            Network::Ethereum => "ethereum",
            Network::Optimism => "optimism",
            Network::Polygon => "polygon",
        }
    }

    /// Parse a network name (case-insensitive)
    pub fn parse(s: &str) -> Option<Network> {
        Network::variants()
            .iter()
            .copied()
            .find(|n| n.name().eq_ignore_ascii_case(s.trim()))
    }

    /// USDC contract address for this network
    pub fn usdc_asset(&self) -> &'static str {
        USDC_DEPLOYMENTS
            .iter()
            .find(|(n, _)| n == self)
            .map(|(_, addr)| *addr)
            .unwrap_or(USDC_DEPLOYMENTS[0].1)
    }
}

impl Default for Network {
    fn default() -> Self {
        Network::BaseSepolia
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// Unknown network names fall back to base-sepolia rather than failing the
// whole config load.
impl<'de> Deserialize<'de> for Network {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Network::parse(&s).unwrap_or_else(|| {
            tracing::warn!(network = %s, "Unknown payment network, falling back to base-sepolia");
            Network::BaseSepolia
        }))
    }
}
