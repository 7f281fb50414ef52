//! Inbound side of the platform channel: typed messages parsed from decrypted callbacks.

mod inbound;

pub use inbound::{ChatType, InboundContent, InboundError, InboundMessage, MixedItem};
