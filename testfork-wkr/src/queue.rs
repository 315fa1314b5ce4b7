//! Bounded control-message queue and its consumer loop.
//!
//! The receive thread is the only producer and the consumer thread the only
//! consumer. A full queue blocks the producer instead of dropping, so the
//! socket keeps being drained while a slow class runs, arrival order is kept,
//! and nothing is lost.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use testfork_common::{ControlMessage, ProtocolError};
use thiserror::Error;
use tracing::{debug, trace};

/// The consumer side is gone; the message could not be queued.
#[derive(Debug, Error)]
#[error("control message queue closed; dropped {kind}")]
pub struct QueueClosed {
    pub kind: &'static str,
}

/// Errors raised by a [`MessageHandler`]. Fatal for the fork.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("failed to reply to control server: {0}")]
    Transport(#[from] ProtocolError),

    #[error("sandbox failure while running {class_name}: {reason}")]
    Sandbox { class_name: String, reason: String },
}

/// Why a consumer stopped on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The server has no more classes for this fork.
    NoMoreWork,
    /// The server sent `StopFork`.
    StopRequested,
    /// The local shutdown signal fired.
    Shutdown,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoMoreWork => write!(f, "no_more_work"),
            Self::StopRequested => write!(f, "stop_requested"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// What the consumer loop does after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop(StopReason),
}

/// How a consumer loop ended.
#[derive(Debug)]
pub enum ConsumerExit {
    /// Normal, cooperative stop.
    Stopped(StopReason),
    /// The producer went away and the queue drained: the transport is gone.
    Disconnected,
    /// A handler failed.
    Failed(HandlerError),
}

/// Processes one dequeued control message.
pub trait MessageHandler {
    fn handle(&mut self, message: ControlMessage) -> Result<Flow, HandlerError>;
}

/// Shared stop flag, checked by the consumer at least once per poll interval.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Create a queue holding at most `capacity` pending messages.
pub fn bounded(
    capacity: usize,
    poll_timeout: Duration,
    shutdown: ShutdownSignal,
) -> (QueueProducer, QueueConsumer) {
    let (tx, rx) = channel::bounded(capacity.max(1));
    (
        QueueProducer { tx },
        QueueConsumer {
            rx,
            poll_timeout,
            shutdown,
        },
    )
}

pub struct QueueProducer {
    tx: Sender<ControlMessage>,
}

impl QueueProducer {
    /// Queue `message`, blocking while the queue is full.
    pub fn enqueue(&self, message: ControlMessage) -> Result<(), QueueClosed> {
        let kind = message.kind();
        trace!("Enqueueing {}", kind);
        self.tx.send(message).map_err(|_| QueueClosed { kind })
    }
}

pub struct QueueConsumer {
    rx: Receiver<ControlMessage>,
    poll_timeout: Duration,
    shutdown: ShutdownSignal,
}

impl QueueConsumer {
    /// Drain the queue into `handler` until it stops, fails, the producer
    /// disconnects, or the shutdown signal fires.
    ///
    /// Handler calls are strictly sequential. Dropping `self` on return closes
    /// the queue, which unblocks a producer waiting on a full queue.
    pub fn consume<H: MessageHandler + ?Sized>(self, handler: &mut H) -> ConsumerExit {
        loop {
            if self.shutdown.is_triggered() {
                debug!("Consumer observed shutdown signal");
                return ConsumerExit::Stopped(StopReason::Shutdown);
            }

            match self.rx.recv_timeout(self.poll_timeout) {
                Ok(message) => {
                    trace!("Dispatching {}", message.kind());
                    match handler.handle(message) {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Stop(reason)) => return ConsumerExit::Stopped(reason),
                        Err(e) => return ConsumerExit::Failed(e),
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return ConsumerExit::Disconnected,
            }
        }
    }
}
