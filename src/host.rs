//! Seams towards the embedding host.
//!
//! The engine never touches transports, muxers or the peer database
//! directly; everything it needs from the host goes through the traits in
//! this module. Implementations are expected to be cheap to clone behind
//! [`Arc`] and callable from any task.

use std::{io, sync::Arc, time::Duration};

use futures::future::BoxFuture;
use libp2p_identity::PeerId;
use multiaddr::Multiaddr;

/// An established connection to a remote peer, capable of opening further
/// protocol streams.
pub trait Connection<S>: Send + Sync {
    fn remote_peer(&self) -> PeerId;

    /// Open a new stream on this connection, negotiated to `protocol`.
    fn new_stream(&self, protocol: &'static str) -> BoxFuture<'_, io::Result<S>>;
}

/// Gives access to connections of the host, reusing an existing connection
/// to the peer where possible and dialing otherwise.
pub trait ConnectionManager<S>: Send + Sync {
    /// `addrs` are the addresses the CONNECT request advertised for the
    /// peer; the host may fold them into its dial attempt or ignore them.
    fn open_connection(
        &self,
        peer: &PeerId,
        addrs: &[Multiaddr],
    ) -> BoxFuture<'_, io::Result<Arc<dyn Connection<S>>>>;
}

/// An inbound stream the host negotiated on a protocol the engine
/// registered for.
pub struct IncomingStream<S> {
    pub stream: S,
    pub remote_peer: PeerId,
    /// The address the stream's connection came in on.
    pub remote_addr: Multiaddr,
}

pub type ProtocolHandler<S> = Arc<dyn Fn(IncomingStream<S>) + Send + Sync>;

/// Registry of inbound protocol handlers.
pub trait Registrar<S>: Send + Sync {
    fn handle(&self, protocol: &'static str, handler: ProtocolHandler<S>) -> io::Result<()>;

    /// Removing an unknown protocol is a no-op.
    fn unhandle(&self, protocol: &'static str);
}

/// The addresses the host is reachable under and wants advertised.
pub trait AddressManager: Send + Sync {
    fn addresses(&self) -> Vec<Multiaddr>;
}

/// Merge-style peer tagging, so the host's connection pruning keeps relay
/// sources around. Best-effort: the engine logs and swallows failures.
pub trait PeerTagger: Send + Sync {
    fn tag_peer(&self, peer: &PeerId, tag: &str, value: u32, ttl: Duration) -> io::Result<()>;
}
