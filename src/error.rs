use std::time::Duration;

use thiserror::Error;

use crate::proto;

/// Errors of the relay engine.
///
/// Everything below `Config` stays inside the scope of a single stream: the
/// HOP handler converts it into a STATUS reply or a stream reset. `Config`
/// surfaces once, at construction.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Codec(#[from] quick_protobuf_codec::Error),
    #[error("Stream closed")]
    StreamClosed,
    #[error("No outbound stream attached")]
    NoOutboundStream,
    #[error("Failed to parse peer id")]
    ParsePeerId,
    #[error("Expected 'peer' field to be set")]
    MissingPeer,
    #[error("Expected 'status' field to be set")]
    MissingStatusField,
    #[error("Unexpected message type 'status'")]
    UnexpectedTypeStatus,
    #[error("Unexpected message type 'connect'")]
    UnexpectedTypeConnect,
    #[error("Unexpected message status '{0:?}'")]
    UnexpectedStatus(proto::Status),
    #[error("Remote reported status '{0:?}'")]
    Refused(proto::Status),
    #[error("Handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    Config(&'static str),
}
