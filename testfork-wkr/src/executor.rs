//! Fork executor: the lifecycle of one fork process.
//!
//! ```text
//! Connecting -> Started -> Running -> Stopping -> Stopped
//!      \____________\__________\__________\_____> Crashed
//! ```
//!
//! The main thread opens the control channel, announces the fork, starts the
//! receive thread (socket -> queue) and the consumer thread (queue ->
//! dispatcher -> sandbox), asks for the first class and then blocks on the
//! consumer. The channel is closed on every exit path.

use crate::connector::{ConnectError, Connector, MessageReceiver};
use crate::context::ForkContext;
use crate::dispatcher::ForkMessageDispatcher;
use crate::queue::{self, ConsumerExit, QueueProducer, ShutdownSignal, StopReason};
use crate::sandbox::TestRunner;
use std::thread::{self, JoinHandle};
use testfork_common::{ControlMessage, ForkState, ProtocolError};
use thiserror::Error;
use tracing::{Span, debug, error, info, warn};

/// Failures before the fork reached `Running`. Always fatal, never retried.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("failed to split control channel: {0}")]
    Channel(#[source] std::io::Error),

    #[error("failed to announce fork to control server: {0}")]
    Announce(#[source] ProtocolError),

    #[error("failed to spawn {name} thread: {source}")]
    Thread {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// How a fork that got past startup ended.
#[derive(Debug)]
pub struct ForkReport {
    pub final_state: ForkState,
    pub classes_executed: usize,
    pub stop_reason: Option<StopReason>,
    /// Why the fork crashed, when it did.
    pub crash: Option<String>,
}

impl ForkReport {
    pub fn is_clean(&self) -> bool {
        self.final_state == ForkState::Stopped
    }
}

/// How the receive thread ended.
#[derive(Debug)]
enum ReceiveExit {
    /// Peer closed the connection, or it was closed locally.
    Closed,
    /// The consumer went away first.
    ConsumerGone,
    Failed(ProtocolError),
}

pub struct ForkExecutor<R: TestRunner + 'static> {
    context: ForkContext,
    runner: R,
    shutdown: ShutdownSignal,
    state: ForkState,
}

impl<R: TestRunner + 'static> ForkExecutor<R> {
    pub fn new(context: ForkContext, runner: R) -> Self {
        Self {
            context,
            runner,
            shutdown: ShutdownSignal::new(),
            state: ForkState::Connecting,
        }
    }

    /// Handle that asks the consumer to stop at its next poll.
    #[cfg(test)]
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Run the fork to completion.
    pub fn execute(mut self) -> Result<ForkReport, StartupError> {
        let span = self.context.span();
        let _enter = span.enter();

        let config = &self.context.config;
        let connector = Connector::open(
            &config.server_host,
            self.context.server_port,
            config.connect_timeout(),
        )
        .inspect_err(|e| error!("Cannot reach control server: {}", e))?;
        info!("Connected to control server at {}", connector.peer());

        let sender = connector.sender().map_err(StartupError::Channel)?;
        let receiver = connector.receiver().map_err(StartupError::Channel)?;

        sender
            .send(&ControlMessage::ForkStarted {
                pipeline_id: self.context.pipeline_id,
                fork_id: self.context.fork_id,
            })
            .map_err(StartupError::Announce)?;
        advance(&mut self.state, ForkState::Started);

        let (producer, consumer) = queue::bounded(
            self.context.config.queue_capacity,
            self.context.config.poll_timeout(),
            self.shutdown.clone(),
        );
        let fork = self.context.fork_id;

        let receive_thread = spawn_named(format!("testfork-recv-{fork}"), move || {
            receive_loop(receiver, producer)
        });
        let receive_thread = match receive_thread {
            Ok(handle) => handle,
            Err(e) => {
                connector.close();
                return Err(e);
            }
        };

        let mut dispatcher = ForkMessageDispatcher::new(fork, self.runner, sender.clone());
        let consumer_thread = spawn_named(format!("testfork-consumer-{fork}"), move || {
            let exit = consumer.consume(&mut dispatcher);
            (exit, dispatcher.executed())
        });
        let consumer_thread = match consumer_thread {
            Ok(handle) => handle,
            Err(e) => {
                connector.close();
                let _ = receive_thread.join();
                return Err(e);
            }
        };
        advance(&mut self.state, ForkState::Running);

        let mut crash = None;
        if let Err(e) = sender.send(&ControlMessage::RequestNextClass { fork_id: fork }) {
            crash = Some(format!("failed to request first class: {e}"));
            self.shutdown.trigger();
        }

        let (stop_reason, classes_executed) = match consumer_thread.join() {
            Ok((ConsumerExit::Stopped(reason), executed)) if crash.is_none() => {
                info!("Consumer stopped ({}) after {} classes", reason, executed);
                (Some(reason), executed)
            }
            Ok((ConsumerExit::Stopped(_), executed)) => (None, executed),
            Ok((ConsumerExit::Disconnected, executed)) => {
                crash = Some("control channel closed by server".to_string());
                (None, executed)
            }
            Ok((ConsumerExit::Failed(e), executed)) => {
                crash = Some(e.to_string());
                (None, executed)
            }
            Err(_) => {
                crash = Some("consumer thread panicked".to_string());
                (None, 0)
            }
        };

        if crash.is_none() {
            advance(&mut self.state, ForkState::Stopping);
            match sender.send(&ControlMessage::ForkStopped { fork_id: fork }) {
                Ok(()) => advance(&mut self.state, ForkState::Stopped),
                Err(e) => crash = Some(format!("failed to send fork_stopped: {e}")),
            }
        }

        connector.close();
        match receive_thread.join() {
            Ok(ReceiveExit::Failed(e)) => {
                warn!("Receive thread failed: {}", e);
                if let Some(reason) = crash.as_mut() {
                    reason.push_str(&format!(" ({e})"));
                }
            }
            Ok(exit) => debug!("Receive thread finished: {:?}", exit),
            Err(_) => warn!("Receive thread panicked"),
        }

        if let Some(reason) = &crash {
            advance(&mut self.state, ForkState::Crashed);
            error!("Fork crashed: {}", reason);
        } else {
            info!("Fork stopped after {} classes", classes_executed);
        }

        Ok(ForkReport {
            final_state: self.state,
            classes_executed,
            stop_reason,
            crash,
        })
    }
}

fn advance(state: &mut ForkState, next: ForkState) {
    if state.can_transition_to(next) {
        debug!("Fork state {} -> {}", state, next);
        *state = next;
    } else {
        warn!("Ignoring illegal fork transition {} -> {}", state, next);
    }
}

/// Spawn a named thread that inherits the current tracing span.
fn spawn_named<T, F>(name: String, f: F) -> Result<JoinHandle<T>, StartupError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let span = Span::current();
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || span.in_scope(f))
        .map_err(|source| StartupError::Thread { name, source })
}

fn receive_loop(mut receiver: MessageReceiver, producer: QueueProducer) -> ReceiveExit {
    loop {
        match receiver.recv() {
            Ok(Some(message)) => {
                if producer.enqueue(message).is_err() {
                    return ReceiveExit::ConsumerGone;
                }
            }
            Ok(None) => return ReceiveExit::Closed,
            Err(e) if e.is_recoverable() => {
                warn!("Skipping malformed control message: {}", e);
            }
            Err(ProtocolError::Io(e)) if is_local_close(&e) => return ReceiveExit::Closed,
            Err(e) => return ReceiveExit::Failed(e),
        }
    }
}

fn is_local_close(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionAborted | std::io::ErrorKind::NotConnected
    )
}
