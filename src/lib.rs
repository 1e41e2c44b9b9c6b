//! Server-side engine of the [libp2p circuit relay v2
//! specification](https://github.com/libp2p/specs/blob/master/relay/circuit-v2.md).
//!
//! A relay lets two peers that cannot dial each other directly talk through
//! a third party: a peer first *reserves* a slot on the relay over the HOP
//! protocol, after which anybody may ask the relay to *connect* them to
//! that peer. The relay notifies the target over the STOP protocol and then
//! splices the two streams together, bounded by a byte and a wall-clock
//! budget.
//!
//! ## Terminology
//!
//! - **Source**: the node initiating a connection via the relay.
//! - **Relay**: this node, asked by a *source* to relay to a *target*.
//! - **Target**: the node holding a reservation, reached via the relay.
//!
//! The engine is host-agnostic: connections, stream negotiation, addresses
//! and the peer database are reached exclusively through the traits in
//! [`host`]. [`Relay`] is a plain value owned by the embedding program;
//! there is no global state and teardown is [`Relay::stop`].

mod config;
mod copy_future;
mod error;
mod gater;
mod hop;
pub mod host;
mod limit;
mod peer_stream;
pub mod proto;
mod service;
pub mod stop;
mod store;

pub use config::RelayConfig;
pub use error::Error;
pub use gater::ConnectionGater;
pub use host::{
    AddressManager, Connection, ConnectionManager, IncomingStream, PeerTagger, ProtocolHandler,
    Registrar,
};
pub use limit::Limit;
pub use peer_stream::{PeerStream, StreamEvent};
pub use service::{Relay, RelayComponents};
pub use store::{Reservation, ReservationStore, ReserveOutcome};

pub const HOP_PROTOCOL_NAME: &str = "/libp2p/circuit/relay/0.2.0/hop";
pub const STOP_PROTOCOL_NAME: &str = "/libp2p/circuit/relay/0.2.0/stop";

/// Tag merged into the peer store for every peer holding a reservation, so
/// the host does not prune the connection out from under it.
pub const RELAY_SOURCE_TAG: &str = "relay-source";

pub(crate) const MAX_MESSAGE_SIZE: usize = 4096;
