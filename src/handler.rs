//! ActionHandler - request/response synchronizer
//!
//! Enforces that on a given connection at most one outbound message is
//! awaiting a reply at any time. Each [`ActionHandler::apply`] writes the
//! outbound message and arms a fresh [`CompletionHandle`] that resolves
//! exactly once: on the next complete inbound message, on transport
//! error/close, or on the per-action timeout, whichever comes first.
//!
//! The handle is a fresh per-attempt channel read rather than reset shared
//! state, so a stale handle can never observe a later reply. Calling `apply`
//! while a previous handle is unresolved is a programming error and fails
//! fast with an `Err`.

use std::time::Duration;

use anyhow::{Result, bail};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::Outcome;
use crate::codec::{self, InboundMessage};
use crate::Protocol;

/// Resolution of one action's completion handle.
#[derive(Debug)]
pub enum ActionResult {
    /// A complete, well-framed reply arrived; carries the parsed message.
    Success(InboundMessage),

    /// No complete reply within the action's timeout.
    Timeout,

    /// Transport-level failure or unexpected close.
    ConnectionError(String),

    /// Inbound bytes violated the protocol's framing rules.
    ProtocolError(String),
}

impl ActionResult {
    pub fn outcome(&self) -> Outcome {
        match self {
            ActionResult::Success(_) => Outcome::Success,
            ActionResult::Timeout => Outcome::Timeout,
            ActionResult::ConnectionError(_) => Outcome::ConnectionError,
            ActionResult::ProtocolError(_) => Outcome::ProtocolError,
        }
    }
}

/// What the connection's reader task observed.
#[derive(Debug)]
pub(crate) enum InboundEvent {
    Message(InboundMessage),
    ProtocolError(String),
    Closed(Option<String>),
}

/// Drives send-await-validate steps over one connection.
///
/// Owns the write half of the connection; a spawned reader task owns the
/// read half and feeds decoded messages through an mpsc channel. Dropping
/// the handler tears both down.
pub struct ActionHandler {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    inbound_rx: mpsc::Receiver<InboundEvent>,
    reader: JoinHandle<()>,

    /// True while an armed handle has not resolved.
    in_flight: bool,

    /// Set once any non-success resolution occurs; protocol state on the
    /// connection is then indeterminate and it must not be reused.
    poisoned: bool,
}

impl ActionHandler {
    /// Split `stream` and spawn the reader task decoding `protocol` frames.
    pub fn from_stream<S>(stream: S, protocol: Protocol) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (inbound_tx, inbound_rx) = mpsc::channel(8);

        let reader = tokio::spawn(read_loop(read_half, protocol, inbound_tx));

        Self {
            writer: Box::new(write_half),
            inbound_rx,
            reader,
            in_flight: false,
            poisoned: false,
        }
    }

    /// Write `outbound` (if any) and arm a handle for the next reply.
    ///
    /// `None` is used for steps that await an unsolicited message, such as
    /// the EPP greeting after connect. A write failure does not error here;
    /// it surfaces as CONNECTION_ERROR when the handle resolves.
    pub async fn apply(
        &mut self,
        outbound: Option<Bytes>,
        timeout: Duration,
    ) -> Result<CompletionHandle<'_>> {
        if self.in_flight {
            bail!("apply called while a previous completion handle is unresolved");
        }
        if self.poisoned {
            bail!("connection is not reusable after a failed or timed-out action");
        }

        self.in_flight = true;

        let mut ready = None;
        if let Some(bytes) = outbound {
            trace!(len = bytes.len(), "writing outbound message");
            let write = async {
                self.writer.write_all(&bytes).await?;
                self.writer.flush().await
            };
            if let Err(e) = write.await {
                ready = Some(ActionResult::ConnectionError(e.to_string()));
            }
        }

        Ok(CompletionHandle {
            handler: self,
            timeout,
            ready,
        })
    }

    /// Shut the connection down. Also happens implicitly on drop.
    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

impl Drop for ActionHandler {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Single-resolution future for one applied action.
///
/// Consuming `resolve` makes double resolution unrepresentable; the `&mut`
/// borrow of the handler keeps a second `apply` from racing an armed handle.
pub struct CompletionHandle<'a> {
    handler: &'a mut ActionHandler,
    timeout: Duration,
    ready: Option<ActionResult>,
}

impl CompletionHandle<'_> {
    /// Wait for the reply, a transport failure, or the timeout.
    pub async fn resolve(self) -> ActionResult {
        let handler = self.handler;

        let result = if let Some(ready) = self.ready {
            ready
        } else {
            match tokio::time::timeout(self.timeout, handler.inbound_rx.recv()).await {
                Ok(Some(InboundEvent::Message(msg))) => ActionResult::Success(msg),
                Ok(Some(InboundEvent::ProtocolError(e))) => ActionResult::ProtocolError(e),
                Ok(Some(InboundEvent::Closed(reason))) => ActionResult::ConnectionError(
                    reason.unwrap_or_else(|| "connection closed by peer".to_string()),
                ),
                Ok(None) => ActionResult::ConnectionError("reader task ended".to_string()),
                Err(_) => ActionResult::Timeout,
            }
        };

        handler.in_flight = false;
        if !result.outcome().is_success() {
            handler.poisoned = true;
        }

        result
    }
}

/// Reader task: accumulate bytes, surface every complete message in order.
///
/// Never panics across the task boundary; decode failures and I/O errors are
/// reported as events and end the task.
async fn read_loop<R>(mut reader: R, protocol: Protocol, tx: mpsc::Sender<InboundEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        loop {
            match codec::decode(protocol, &mut buf) {
                Ok(Some(message)) => {
                    trace!(%protocol, "decoded inbound message");
                    if tx.send(InboundEvent::Message(message)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(%protocol, error = %e, "protocol error on inbound stream");
                    let _ = tx.send(InboundEvent::ProtocolError(e.to_string())).await;
                    return;
                }
            }
        }

        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                let _ = tx.send(InboundEvent::Closed(None)).await;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = tx.send(InboundEvent::Closed(Some(e.to_string()))).await;
                return;
            }
        }
    }
}
