//! Interconnects two substreams, feeding the receiver side of one into the
//! sender side of the other and vice versa, under a shared byte budget and
//! an optional wall-clock budget.
//!
//! Inspired by [`futures::io::Copy`].

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{
    future::{Future, FutureExt},
    io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader},
};
use futures_timer::Delay;

use crate::limit::Limit;

/// Bidirectional splice of two duplex streams.
///
/// Exhausting the byte budget or the duration budget closes both sides and
/// resolves with the total number of bytes forwarded; a budget running out
/// is a normal end of a relayed connection. Each direction drains
/// independently: one side reaching EOF (or failing its reads) closes the
/// opposite write half while the other direction keeps going.
pub(crate) struct CopyFuture<S, D> {
    src: BufReader<S>,
    dst: BufReader<D>,

    src_to_dst: DirState,
    dst_to_src: DirState,

    deadline: Option<Delay>,
    max_bytes: u64,
    transferred: u64,
    draining: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirState {
    Forwarding,
    Closing,
    Done,
}

impl<S: AsyncRead, D: AsyncRead> CopyFuture<S, D> {
    pub(crate) fn new(src: S, dst: D, limit: Limit) -> Self {
        CopyFuture {
            src: BufReader::new(src),
            dst: BufReader::new(dst),
            src_to_dst: DirState::Forwarding,
            dst_to_src: DirState::Forwarding,
            deadline: (!limit.duration.is_zero()).then(|| Delay::new(limit.duration)),
            max_bytes: limit.data,
            transferred: 0,
            draining: false,
        }
    }
}

impl<S, D> Future for CopyFuture<S, D>
where
    S: AsyncRead + AsyncWrite + Unpin,
    D: AsyncRead + AsyncWrite + Unpin,
{
    type Output = io::Result<u64>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        if !this.draining {
            if let Some(deadline) = this.deadline.as_mut() {
                if deadline.poll_unpin(cx).is_ready() {
                    this.begin_drain();
                }
            }
        }

        loop {
            if !this.draining && this.max_bytes > 0 && this.transferred >= this.max_bytes {
                this.begin_drain();
            }

            let src_step = poll_direction(
                &mut this.src,
                &mut this.dst,
                &mut this.src_to_dst,
                &mut this.transferred,
                this.max_bytes,
                cx,
            )?;
            let dst_step = poll_direction(
                &mut this.dst,
                &mut this.src,
                &mut this.dst_to_src,
                &mut this.transferred,
                this.max_bytes,
                cx,
            )?;

            match (src_step, dst_step) {
                (Step::Done, Step::Done) => return Poll::Ready(Ok(this.transferred)),
                (Step::Progressed, _) | (_, Step::Progressed) => continue,
                _ => return Poll::Pending,
            }
        }
    }
}

impl<S, D> CopyFuture<S, D> {
    fn begin_drain(&mut self) {
        self.draining = true;
        if self.src_to_dst != DirState::Done {
            self.src_to_dst = DirState::Closing;
        }
        if self.dst_to_src != DirState::Done {
            self.dst_to_src = DirState::Closing;
        }
    }
}

enum Step {
    Progressed,
    Pending,
    Done,
}

/// Drives one direction: forward a chunk from `src` to `dst`, close `dst`
/// once `src` is exhausted.
///
/// A failing read counts as exhaustion; a failing or stalled-at-zero write
/// aborts the circuit.
fn poll_direction<R, W>(
    src: &mut R,
    dst: &mut W,
    state: &mut DirState,
    transferred: &mut u64,
    max_bytes: u64,
    cx: &mut Context<'_>,
) -> io::Result<Step>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        match state {
            DirState::Forwarding => {
                let buffer = match Pin::new(&mut *src).poll_fill_buf(cx) {
                    Poll::Ready(Ok(buffer)) => buffer,
                    Poll::Ready(Err(_)) => {
                        *state = DirState::Closing;
                        continue;
                    }
                    Poll::Pending => {
                        // Push buffered writes out while the source stalls.
                        let _ = Pin::new(&mut *dst).poll_flush(cx)?;
                        return Ok(Step::Pending);
                    }
                };

                if buffer.is_empty() {
                    let _ = Pin::new(&mut *dst).poll_flush(cx)?;
                    *state = DirState::Closing;
                    continue;
                }

                let budget = if max_bytes == 0 {
                    u64::MAX
                } else {
                    max_bytes.saturating_sub(*transferred)
                };
                let allowed = usize::try_from(budget).unwrap_or(usize::MAX).min(buffer.len());
                if allowed == 0 {
                    // Budget exhausted; the caller transitions both sides.
                    return Ok(Step::Pending);
                }

                let n = match Pin::new(&mut *dst).poll_write(cx, &buffer[..allowed]) {
                    Poll::Ready(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
                    Poll::Ready(Ok(n)) => n,
                    Poll::Ready(Err(e)) => return Err(e),
                    Poll::Pending => return Ok(Step::Pending),
                };
                Pin::new(&mut *src).consume(n);
                *transferred += n as u64;

                return Ok(Step::Progressed);
            }
            DirState::Closing => match Pin::new(&mut *dst).poll_close(cx) {
                // A close failure past this point is uninteresting, the
                // stream is being torn down either way.
                Poll::Ready(_) => {
                    *state = DirState::Done;
                    return Ok(Step::Progressed);
                }
                Poll::Pending => return Ok(Step::Pending),
            },
            DirState::Done => return Ok(Step::Done),
        }
    }
}
