//! Per-stream handler of the HOP protocol.
//!
//! Each inbound HOP stream reads exactly one request and answers exactly
//! one STATUS, except that an accepted CONNECT transitions into relaying
//! instead of closing. Errors never leave this module: whatever goes wrong
//! inside a stream's scope either becomes a STATUS reply or a reset.

use std::sync::Arc;

use futures::{future, prelude::*};
use libp2p_identity::PeerId;
use multiaddr::{Multiaddr, Protocol};

use crate::{
    config::RelayConfig,
    copy_future::CopyFuture,
    error::Error,
    gater::ConnectionGater,
    host::{AddressManager, ConnectionManager, IncomingStream, PeerTagger},
    peer_stream::PeerStream,
    proto, stop,
    store::{ReservationStore, ReserveOutcome},
    RELAY_SOURCE_TAG,
};

/// State shared by every inbound HOP stream.
pub(crate) struct HopHandler<S> {
    pub(crate) local_peer_id: PeerId,
    pub(crate) config: RelayConfig,
    pub(crate) store: Arc<ReservationStore>,
    pub(crate) gater: Arc<ConnectionGater>,
    pub(crate) connections: Arc<dyn ConnectionManager<S>>,
    pub(crate) addresses: Arc<dyn AddressManager>,
    pub(crate) tagger: Arc<dyn PeerTagger>,
}

impl<S> HopHandler<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub(crate) async fn handle(&self, incoming: IncomingStream<S>) {
        let peer = incoming.remote_peer;
        if let Err(error) = self.try_handle(incoming).await {
            tracing::debug!(%peer, %error, "inbound hop stream failed");
        }
    }

    async fn try_handle(&self, incoming: IncomingStream<S>) -> Result<(), Error> {
        let IncomingStream {
            stream: io,
            remote_peer,
            remote_addr,
        } = incoming;

        let mut stream = PeerStream::new(remote_peer);
        stream.attach(io);

        let request = match tokio::time::timeout(self.config.handshake_timeout, stream.read())
            .await
        {
            // The remote never sent its request; reset without a status.
            Err(_) => return Err(Error::HandshakeTimeout(self.config.handshake_timeout)),
            Ok(None) => return Err(Error::StreamClosed),
            Ok(Some(Err(error))) => {
                deny(&mut stream, proto::Status::MalformedMessage).await?;
                stream.close().await?;
                return Err(error);
            }
            Ok(Some(Ok(request))) => request,
        };

        match request.type_pb {
            proto::HopMessageType::Reserve => {
                self.handle_reserve(&mut stream, remote_peer, remote_addr)
                    .await?;
                stream.close().await
            }
            proto::HopMessageType::Connect => {
                self.handle_connect(stream, remote_peer, request.peer).await
            }
            proto::HopMessageType::Status => {
                deny(&mut stream, proto::Status::UnexpectedMessage).await?;
                stream.close().await
            }
        }
    }

    async fn handle_reserve(
        &self,
        stream: &mut PeerStream<S, proto::HopMessage>,
        peer: PeerId,
        remote_addr: Multiaddr,
    ) -> Result<(), Error> {
        if self.gater.denies_reservation(&peer) {
            tracing::debug!(%peer, "reservation denied by gater");
            return deny(stream, proto::Status::PermissionDenied).await;
        }

        let limit = self.config.connection_limit();
        let (expire, renewed) = match self.store.reserve(peer, vec![remote_addr], limit) {
            ReserveOutcome::Refused => {
                tracing::debug!(%peer, "reservation refused, store at capacity");
                return deny(stream, proto::Status::ReservationRefused).await;
            }
            ReserveOutcome::Accepted { expire, renewed } => (expire, renewed),
        };

        // Tagging is best-effort; the reservation stands either way.
        if let Err(error) =
            self.tagger
                .tag_peer(&peer, RELAY_SOURCE_TAG, 1, self.config.reservation_ttl)
        {
            tracing::warn!(%peer, %error, "failed to tag relay source peer");
        }

        let addrs = self.reservation_addrs();
        if addrs.is_empty() {
            tracing::debug!(
                "Accepting relay reservation without providing external addresses of local node. \
                 Thus the remote node might not be able to advertise its relayed address."
            )
        }

        tracing::debug!(%peer, renewed, "reservation accepted");

        stream
            .write(proto::HopMessage {
                type_pb: proto::HopMessageType::Status,
                peer: None,
                reservation: Some(proto::Reservation {
                    expire,
                    addrs: addrs.iter().map(|a| a.to_vec()).collect(),
                    voucher: None,
                }),
                limit: (!limit.is_unlimited()).then(|| limit.to_proto()),
                status: Some(proto::Status::Ok),
            })
            .await
    }

    async fn handle_connect(
        &self,
        mut stream: PeerStream<S, proto::HopMessage>,
        src: PeerId,
        peer: Option<proto::Peer>,
    ) -> Result<(), Error> {
        let (dst, dst_addrs) = match parse_target(peer) {
            Some(target) => target,
            None => {
                deny(&mut stream, proto::Status::MalformedMessage).await?;
                return stream.close().await;
            }
        };

        // The relay never holds a reservation for itself.
        if dst == self.local_peer_id {
            deny(&mut stream, proto::Status::NoReservation).await?;
            return stream.close().await;
        }

        let Some(reservation) = self.store.get(&dst) else {
            tracing::debug!(%src, %dst, "connect to a target without reservation");
            deny(&mut stream, proto::Status::NoReservation).await?;
            return stream.close().await;
        };

        if self.gater.denies_outbound_circuit(&src, &dst) {
            tracing::debug!(%src, %dst, "circuit denied by gater");
            deny(&mut stream, proto::Status::PermissionDenied).await?;
            return stream.close().await;
        }

        let limit = reservation.limit.min(self.config.connection_limit());

        let (mut dst_io, dst_pending) = match stop::connect(
            &*self.connections,
            src,
            dst,
            dst_addrs,
            limit,
            self.config.handshake_timeout,
        )
        .await
        {
            Ok(parts) => parts,
            Err(error) => {
                // The cause stays in the log, the peer only learns that the
                // connection failed.
                tracing::debug!(%src, %dst, %error, "failed to open stop stream to target");
                deny(&mut stream, proto::Status::ConnectionFailed).await?;
                return stream.close().await;
            }
        };

        stream
            .write(proto::HopMessage {
                type_pb: proto::HopMessageType::Status,
                peer: None,
                reservation: None,
                limit: (!limit.is_unlimited()).then(|| limit.to_proto()),
                status: Some(proto::Status::Ok),
            })
            .await?;

        let (mut src_io, src_pending) = stream.into_io()?;

        tracing::debug!(%src, %dst, "relaying connection");

        let (to_src, to_dst) = future::join(
            src_io.write_all(&dst_pending),
            dst_io.write_all(&src_pending),
        )
        .await;
        to_src?;
        to_dst?;

        let transferred = CopyFuture::new(src_io, dst_io, limit).await?;

        tracing::debug!(%src, %dst, transferred, "circuit closed");

        Ok(())
    }

    /// The addresses advertised in a reservation: the relay's external
    /// addresses, skipping circuit addresses, each carrying the relay's
    /// peer id. The client appends `/p2p-circuit` itself.
    fn reservation_addrs(&self) -> Vec<Multiaddr> {
        self.addresses
            .addresses()
            .into_iter()
            .filter(|addr| !addr.iter().any(|p| matches!(p, Protocol::P2pCircuit)))
            .map(|addr| {
                if addr.iter().any(|p| matches!(p, Protocol::P2p(_))) {
                    addr
                } else {
                    addr.with(Protocol::P2p(self.local_peer_id))
                }
            })
            .collect()
    }
}

fn parse_target(peer: Option<proto::Peer>) -> Option<(PeerId, Vec<Multiaddr>)> {
    let peer = peer?;
    if peer.id.is_empty() {
        return None;
    }
    let id = PeerId::from_bytes(&peer.id).ok()?;
    let addrs = peer
        .addrs
        .into_iter()
        .filter_map(|a| Multiaddr::try_from(a).ok())
        .collect();
    Some((id, addrs))
}

async fn deny<S>(
    stream: &mut PeerStream<S, proto::HopMessage>,
    status: proto::Status,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write(proto::HopMessage {
            type_pb: proto::HopMessageType::Status,
            peer: None,
            reservation: None,
            limit: None,
            status: Some(status),
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_with_missing_empty_or_garbage_id_is_rejected() {
        assert!(parse_target(None).is_none());
        assert!(parse_target(Some(proto::Peer {
            id: vec![],
            addrs: vec![],
        }))
        .is_none());
        assert!(parse_target(Some(proto::Peer {
            id: vec![0xde, 0xad],
            addrs: vec![],
        }))
        .is_none());
    }

    #[test]
    fn target_addrs_skip_undecodable_entries() {
        let peer = PeerId::random();
        let good: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();

        let (id, addrs) = parse_target(Some(proto::Peer {
            id: peer.to_bytes(),
            addrs: vec![good.to_vec(), vec![0xff, 0xff, 0xff]],
        }))
        .unwrap();

        assert_eq!(id, peer);
        assert_eq!(addrs, vec![good]);
    }
}
