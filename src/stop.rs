//! The STOP leg of a circuit: dialing the target on behalf of the relay,
//! and accepting such a dial on the target.

use std::time::Duration;

use asynchronous_codec::{Framed, FramedParts};
use bytes::Bytes;
use futures::prelude::*;
use libp2p_identity::PeerId;
use multiaddr::Multiaddr;

use crate::{
    error::Error, gater::ConnectionGater, host::ConnectionManager, limit::Limit, proto,
    MAX_MESSAGE_SIZE, STOP_PROTOCOL_NAME,
};

type StopFramed<S> = Framed<S, quick_protobuf_codec::Codec<proto::StopMessage>>;

/// Negotiate a STOP stream to `dst` announcing an inbound circuit from
/// `src`.
///
/// The whole exchange, connection included, must finish within
/// `handshake_timeout`. Any failure maps to a single error here; the caller
/// reports `CONNECTION_FAILED` to the source and the stream is dropped.
pub(crate) async fn connect<S>(
    connections: &dyn ConnectionManager<S>,
    src: PeerId,
    dst: PeerId,
    dst_addrs: Vec<Multiaddr>,
    limit: Limit,
    handshake_timeout: Duration,
) -> Result<(S, Bytes), Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::time::timeout(handshake_timeout, async move {
        let connection = connections.open_connection(&dst, &dst_addrs).await?;
        let io = connection.new_stream(STOP_PROTOCOL_NAME).await?;

        let mut substream: StopFramed<S> =
            Framed::new(io, quick_protobuf_codec::Codec::new(MAX_MESSAGE_SIZE));

        substream
            .send(proto::StopMessage {
                type_pb: proto::StopMessageType::Connect,
                peer: Some(proto::Peer {
                    id: src.to_bytes(),
                    addrs: vec![],
                }),
                limit: (!limit.is_unlimited()).then(|| limit.to_proto()),
                status: None,
            })
            .await?;

        let proto::StopMessage {
            type_pb,
            peer: _,
            limit: _,
            status,
        } = substream.next().await.ok_or(Error::StreamClosed)??;

        match type_pb {
            proto::StopMessageType::Connect => return Err(Error::UnexpectedTypeConnect),
            proto::StopMessageType::Status => {}
        }

        match status.ok_or(Error::MissingStatusField)? {
            proto::Status::Ok => {}
            status @ (proto::Status::ResourceLimitExceeded
            | proto::Status::PermissionDenied
            | proto::Status::ConnectionFailed) => return Err(Error::Refused(status)),
            status => return Err(Error::UnexpectedStatus(status)),
        }

        let FramedParts {
            io,
            read_buffer,
            write_buffer,
            ..
        } = substream.into_parts();
        assert!(
            write_buffer.is_empty(),
            "Expect a flushed Framed to have an empty write buffer."
        );

        Ok((io, read_buffer.freeze()))
    })
    .await
    .map_err(|_| Error::HandshakeTimeout(handshake_timeout))?
}

/// An inbound circuit announced by a relay, pending accept or deny.
pub struct Circuit<S> {
    substream: StopFramed<S>,
    src_peer_id: PeerId,
    limit: Limit,
}

/// Read the CONNECT announcement off a freshly negotiated inbound STOP
/// stream.
pub async fn handle_open_circuit<S>(io: S) -> Result<Circuit<S>, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut substream: StopFramed<S> =
        Framed::new(io, quick_protobuf_codec::Codec::new(MAX_MESSAGE_SIZE));

    let proto::StopMessage {
        type_pb,
        peer,
        limit,
        status: _,
    } = substream.next().await.ok_or(Error::StreamClosed)??;

    match type_pb {
        proto::StopMessageType::Connect => {
            let peer = peer.ok_or(Error::MissingPeer)?;
            if peer.id.is_empty() {
                return Err(Error::MissingPeer);
            }
            let src_peer_id = PeerId::from_bytes(&peer.id).map_err(|_| Error::ParsePeerId)?;
            Ok(Circuit {
                substream,
                src_peer_id,
                limit: Limit::from_proto(limit),
            })
        }
        proto::StopMessageType::Status => Err(Error::UnexpectedTypeStatus),
    }
}

impl<S> Circuit<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn src_peer_id(&self) -> PeerId {
        self.src_peer_id
    }

    /// The limit the relay announced for this circuit.
    pub fn limit(&self) -> Limit {
        self.limit
    }

    pub async fn accept(mut self) -> Result<(S, Bytes), Error> {
        self.send(proto::Status::Ok).await?;

        let FramedParts {
            io,
            read_buffer,
            write_buffer,
            ..
        } = self.substream.into_parts();
        assert!(
            write_buffer.is_empty(),
            "Expect a flushed Framed to have an empty write buffer."
        );

        Ok((io, read_buffer.freeze()))
    }

    pub async fn deny(mut self, status: proto::Status) -> Result<(), Error> {
        self.send(status).await?;
        self.substream.close().await.map_err(Into::into)
    }

    async fn send(&mut self, status: proto::Status) -> Result<(), Error> {
        self.substream
            .send(proto::StopMessage {
                type_pb: proto::StopMessageType::Status,
                peer: None,
                limit: None,
                status: Some(status),
            })
            .await?;
        self.substream.flush().await?;
        Ok(())
    }
}

/// A circuit accepted on the target side.
pub struct AcceptedCircuit<S> {
    pub src_peer_id: PeerId,
    pub limit: Limit,
    pub io: S,
    /// Bytes of the relayed connection that were already buffered behind
    /// the handshake.
    pub pending_data: Bytes,
}

/// Target-side entry point: answer an inbound STOP stream, consulting the
/// gater. Returns `None` when the gater vetoed the circuit (the relay got
/// a PERMISSION_DENIED status).
pub async fn accept_circuit<S>(
    io: S,
    local_peer_id: PeerId,
    gater: &ConnectionGater,
) -> Result<Option<AcceptedCircuit<S>>, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let circuit = handle_open_circuit(io).await?;
    let src_peer_id = circuit.src_peer_id();

    if gater.denies_inbound_circuit(&src_peer_id, &local_peer_id) {
        tracing::debug!(peer=%src_peer_id, "inbound circuit denied by gater");
        circuit.deny(proto::Status::PermissionDenied).await?;
        return Ok(None);
    }

    let limit = circuit.limit();
    let (io, pending_data) = circuit.accept().await?;

    Ok(Some(AcceptedCircuit {
        src_peer_id,
        limit,
        io,
        pending_data,
    }))
}
