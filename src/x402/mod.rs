//! x402 payment mediation: networks, money, facilitator verification,
//! inbound admission policy, and outbound payment synthesis.

pub mod facilitator;
pub mod mediator;
pub mod network;
pub mod types;
pub mod wallet;

pub use facilitator::{Facilitator, FacilitatorClient, Verdict};
pub use mediator::{
    ApiKeyEntry, EntryKind, ForwardDirective, PaymentMediator, PaymentMethod, PaymentMode,
    PaymentOutcome, PaymentPolicy, Pricing, UpstreamPaymentPolicy, compute_markup_price,
};
pub use network::Network;
pub use types::{
    HeaderBag, InboundAuth, Markup, Money, PASSTHROUGH_HEADERS, PaymentRequirement,
    PaymentRequirements, atomic_units,
};
pub use wallet::{OutboundWallet, WalletError};
