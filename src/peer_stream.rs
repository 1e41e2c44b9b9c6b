//! Wrapper around a peer's protocol stream carrying length-prefixed
//! protobuf messages.
//!
//! The inbound side is cancellable: tripping the [`AbortHandle`] makes a
//! pending [`PeerStream::read`] resolve to `None`, the same way a clean
//! remote close does. No error surfaces on cancellation.

use asynchronous_codec::{Framed, FramedParts};
use bytes::Bytes;
use futures::{
    channel::mpsc,
    future::{self, AbortHandle, Abortable, Either, Shared},
    prelude::*,
};
use libp2p_identity::PeerId;
use quick_protobuf::{MessageRead, MessageWrite};
use quick_protobuf_codec::Codec;

use crate::{error::Error, MAX_MESSAGE_SIZE};

/// Lifecycle notifications of a [`PeerStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// The first outbound stream was attached.
    OutboundAttached,
    /// The wrapper was closed. Fired at most once; replacing an attached
    /// stream does not count as a close.
    Closed,
}

pub struct PeerStream<S, M> {
    peer: PeerId,
    io: Option<Framed<S, Codec<M>>>,
    abort_handle: AbortHandle,
    aborted: Shared<Abortable<future::Pending<()>>>,
    attached_once: bool,
    closed: bool,
    listeners: Vec<mpsc::UnboundedSender<StreamEvent>>,
}

impl<S, M> PeerStream<S, M>
where
    S: AsyncRead + AsyncWrite + Unpin,
    M: MessageWrite + for<'a> MessageRead<'a>,
{
    pub fn new(peer: PeerId) -> Self {
        let (abort_handle, registration) = AbortHandle::new_pair();
        PeerStream {
            peer,
            io: None,
            abort_handle,
            aborted: Abortable::new(future::pending(), registration).shared(),
            attached_once: false,
            closed: false,
            listeners: Vec::new(),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Attach `io`, replacing a previously attached stream. The replaced
    /// stream is ended silently; only the first attach is announced.
    pub fn attach(&mut self, io: S) {
        self.io = Some(Framed::new(io, Codec::new(MAX_MESSAGE_SIZE)));
        if !self.attached_once {
            self.attached_once = true;
            self.emit(StreamEvent::OutboundAttached);
        }
    }

    /// Handle to cancel a pending [`PeerStream::read`].
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort_handle.clone()
    }

    /// Send one message, flushing eagerly.
    pub async fn write(&mut self, msg: M) -> Result<(), Error> {
        let io = self.io.as_mut().ok_or(Error::NoOutboundStream)?;
        io.send(msg).await?;
        io.flush().await?;
        Ok(())
    }

    /// The next inbound message. Resolves to `None` on a clean remote
    /// close, when nothing is attached, or once the abort handle fired.
    pub async fn read(&mut self) -> Option<Result<M, Error>> {
        if self.abort_handle.is_aborted() {
            return None;
        }
        let io = self.io.as_mut()?;

        match future::select(io.next(), self.aborted.clone()).await {
            Either::Left((item, _)) => item.map(|r| r.map_err(Error::Codec)),
            Either::Right(_) => None,
        }
    }

    /// Close the write half and end the wrapper. Pending reads resolve to
    /// `None`; the close event fires at most once.
    pub async fn close(&mut self) -> Result<(), Error> {
        self.abort_handle.abort();
        let io = self.io.take();
        if !self.closed {
            self.closed = true;
            self.emit(StreamEvent::Closed);
        }
        if let Some(mut io) = io {
            io.close().await?;
        }
        Ok(())
    }

    /// Hand back the raw stream together with any already buffered inbound
    /// bytes, detaching the wrapper.
    pub fn into_io(mut self) -> Result<(S, Bytes), Error> {
        let framed = self.io.take().ok_or(Error::NoOutboundStream)?;
        let FramedParts {
            io,
            read_buffer,
            write_buffer,
            ..
        } = framed.into_parts();
        assert!(
            write_buffer.is_empty(),
            "Expect a flushed Framed to have an empty write buffer."
        );
        Ok((io, read_buffer.freeze()))
    }

    /// Subscribe to lifecycle events of this wrapper.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded();
        self.listeners.push(tx);
        rx
    }

    fn emit(&mut self, event: StreamEvent) {
        self.listeners
            .retain(|listener| listener.unbounded_send(event).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        task::{Context, Poll},
    };

    use futures::executor::block_on;

    use super::*;
    use crate::proto;

    /// A stream that is never ready, for exercising cancellation.
    struct PendingIo;

    impl AsyncRead for PendingIo {
        fn poll_read(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
            _: &mut [u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for PendingIo {
        fn poll_write(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
            _: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Pending
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn reserve_message() -> proto::HopMessage {
        proto::HopMessage {
            type_pb: proto::HopMessageType::Reserve,
            ..Default::default()
        }
    }

    #[test]
    fn write_without_attached_stream_fails() {
        let mut stream: PeerStream<futures::io::Cursor<Vec<u8>>, proto::HopMessage> =
            PeerStream::new(PeerId::random());

        let err = block_on(stream.write(reserve_message())).unwrap_err();
        assert!(matches!(err, Error::NoOutboundStream));
    }

    #[test]
    fn written_message_reads_back() {
        let mut writer: PeerStream<futures::io::Cursor<Vec<u8>>, proto::HopMessage> =
            PeerStream::new(PeerId::random());
        writer.attach(futures::io::Cursor::new(Vec::new()));
        block_on(writer.write(reserve_message())).unwrap();

        let (io, leftover) = writer.into_io().unwrap();
        assert!(leftover.is_empty());

        let mut reader: PeerStream<futures::io::Cursor<Vec<u8>>, proto::HopMessage> =
            PeerStream::new(PeerId::random());
        reader.attach(futures::io::Cursor::new(io.into_inner()));

        let msg = block_on(reader.read()).unwrap().unwrap();
        assert_eq!(msg, reserve_message());
        // Cursor end behaves like a clean remote close.
        assert!(block_on(reader.read()).is_none());
    }

    #[test]
    fn oversized_message_is_a_codec_error() {
        // Varint length prefix of 5000 bytes, above the message size cap.
        let bytes = vec![0x88, 0x27];

        let mut stream: PeerStream<futures::io::Cursor<Vec<u8>>, proto::HopMessage> =
            PeerStream::new(PeerId::random());
        stream.attach(futures::io::Cursor::new(bytes));

        let err = block_on(stream.read()).unwrap().unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }

    #[test]
    fn abort_completes_a_pending_read_without_error() {
        let mut stream: PeerStream<PendingIo, proto::HopMessage> = PeerStream::new(PeerId::random());
        stream.attach(PendingIo);

        let handle = stream.abort_handle();
        handle.abort();

        assert!(block_on(stream.read()).is_none());
    }

    #[test]
    fn events_fire_on_first_attach_and_close_only() {
        let mut stream: PeerStream<PendingIo, proto::HopMessage> = PeerStream::new(PeerId::random());
        let mut events = stream.subscribe();

        stream.attach(PendingIo);
        assert_eq!(events.try_next().unwrap(), Some(StreamEvent::OutboundAttached));

        // Replacing the stream ends the previous one without a close event.
        stream.attach(PendingIo);
        assert!(events.try_next().is_err());

        block_on(stream.close()).unwrap();
        assert_eq!(events.try_next().unwrap(), Some(StreamEvent::Closed));

        block_on(stream.close()).unwrap();
        assert!(matches!(events.try_next(), Err(_) | Ok(None)));
    }
}
