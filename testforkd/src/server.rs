//! TCP control server that forks connect back to.
//!
//! Each connection gets a reader loop and a writer task. The first message
//! must be `ForkStarted`, which binds the connection to a pipeline and fork.
//! Replies and server-initiated messages share one outbound channel, so the
//! fork sees them in the order they were produced.

use crate::dispatcher::{DispatchError, PipelineRegistry};
use crate::handlers::ServerMessageHandlers;
use std::net::SocketAddr;
use std::sync::Arc;
use testfork_common::{ControlMessage, ProtocolError, read_message_async, write_message_async};
use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection closed before fork_started")]
    NoHandshake,

    #[error("expected fork_started, got {0}")]
    BadHandshake(&'static str),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

pub struct ControlServer {
    listener: TcpListener,
    registry: Arc<PipelineRegistry>,
}

impl ControlServer {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        registry: Arc<PipelineRegistry>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, registry })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the accept loop on the runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        if let Ok(addr) = self.local_addr() {
            info!("Control server listening on {}", addr);
        }
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let registry = Arc::clone(&self.registry);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, registry).await {
                            warn!("Control session from {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Accept error: {}", e);
                }
            }
        }
    }
}

/// Serve one fork connection until it closes.
pub async fn handle_connection(
    stream: TcpStream,
    registry: Arc<PipelineRegistry>,
) -> Result<(), SessionError> {
    let _ = stream.set_nodelay(true);
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let (pipeline_id, fork) = loop {
        match read_message_async(&mut reader).await {
            Ok(Some(ControlMessage::ForkStarted {
                pipeline_id,
                fork_id,
            })) => break (pipeline_id, fork_id),
            Ok(Some(other)) => return Err(SessionError::BadHandshake(other.kind())),
            Ok(None) => return Err(SessionError::NoHandshake),
            Err(e) if e.is_recoverable() => warn!("Skipping malformed handshake frame: {}", e),
            Err(e) => return Err(e.into()),
        }
    };

    let dispatcher = registry.get(pipeline_id)?;
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ControlMessage>();
    dispatcher.fork_started(fork, outbound.clone())?;
    let handlers = ServerMessageHandlers::new(Arc::clone(&dispatcher), fork);
    let span = info_span!("session", pipeline = %pipeline_id, fork = %fork);

    let writer = tokio::spawn(
        async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = write_message_async(&mut write_half, &message).await {
                    debug!("Failed to send {}: {}", message.kind(), e);
                    break;
                }
            }
        }
        .instrument(span.clone()),
    );

    let result = async {
        loop {
            match read_message_async(&mut reader).await {
                Ok(Some(message)) => {
                    debug!("Received {}", message);
                    if let Some(reply) = handlers.handle(message) {
                        // Only fails once the writer is gone, and then the
                        // read side fails next.
                        let _ = outbound.send(reply);
                    }
                }
                Ok(None) => return Ok(()),
                Err(e) if e.is_recoverable() => warn!("Skipping malformed control message: {}", e),
                Err(e) => return Err(SessionError::from(e)),
            }
        }
    }
    .instrument(span)
    .await;

    dispatcher.connection_lost(fork);
    drop(outbound);
    let _ = writer.await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::PipelineDispatcher;
    use crate::events::EventBus;
    use crate::pipeline::{Pipeline, PipelineSnapshot};
    use std::collections::HashSet;
    use std::time::Duration;
    use testfork_common::{ClassOutcome, ForkId, ForkState, PipelineId, PipelineState, ReclaimPolicy};
    use tokio::io::AsyncWriteExt;

    async fn start_server(
        classes: &[&str],
        reclaim: ReclaimPolicy,
    ) -> (SocketAddr, Arc<PipelineDispatcher>) {
        let mut registry = PipelineRegistry::new();
        let dispatcher = registry.insert(PipelineDispatcher::new(
            Pipeline::new(PipelineId::new(0), classes.iter().copied()),
            EventBus::default(),
            reclaim,
        ));
        let server = ControlServer::bind("127.0.0.1:0", Arc::new(registry))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        server.spawn();
        (addr, dispatcher)
    }

    async fn connect(addr: SocketAddr, fork: u32) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_message_async(
            &mut stream,
            &ControlMessage::ForkStarted {
                pipeline_id: PipelineId::new(0),
                fork_id: ForkId::new(fork),
            },
        )
        .await
        .unwrap();
        stream
    }

    async fn recv(stream: &mut TcpStream) -> Option<ControlMessage> {
        tokio::time::timeout(Duration::from_secs(5), read_message_async(stream))
            .await
            .expect("timed out waiting for server")
            .unwrap()
    }

    /// Pull classes until told to stop, passing each one.
    async fn run_fork(mut stream: TcpStream, fork: u32) -> Vec<String> {
        let fork_id = ForkId::new(fork);
        let mut ran = Vec::new();
        loop {
            write_message_async(&mut stream, &ControlMessage::RequestNextClass { fork_id })
                .await
                .unwrap();
            match recv(&mut stream).await {
                Some(ControlMessage::ExecuteClass { class_name }) => {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    write_message_async(
                        &mut stream,
                        &ControlMessage::class_completed(class_name.clone(), ClassOutcome::Pass),
                    )
                    .await
                    .unwrap();
                    ran.push(class_name);
                }
                Some(ControlMessage::NoMoreWork) => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        write_message_async(&mut stream, &ControlMessage::ForkStopped { fork_id })
            .await
            .unwrap();
        ran
    }

    async fn wait(dispatcher: &PipelineDispatcher) -> PipelineSnapshot {
        tokio::time::timeout(Duration::from_secs(5), dispatcher.wait_complete())
            .await
            .expect("pipeline did not complete")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_single_fork_round_trip() {
        testfork_common::testing::init_test_logging();
        let (addr, dispatcher) = start_server(&["A", "B"], ReclaimPolicy::Leave).await;

        let stream = connect(addr, 0).await;
        let ran = run_fork(stream, 0).await;
        assert_eq!(ran, vec!["A", "B"]);

        let snapshot = wait(&dispatcher).await;
        assert_eq!(snapshot.state, PipelineState::Complete);
        assert!(snapshot.is_success());
        assert_eq!(snapshot.forks[&ForkId::new(0)], ForkState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_forks_cover_backlog_once() {
        let classes: Vec<String> = (0..30).map(|i| format!("C{i}")).collect();
        let names: Vec<&str> = classes.iter().map(String::as_str).collect();
        let (addr, dispatcher) = start_server(&names, ReclaimPolicy::Leave).await;

        let mut tasks = Vec::new();
        for fork in 0..4 {
            let stream = connect(addr, fork).await;
            tasks.push(tokio::spawn(run_fork(stream, fork)));
        }

        let mut seen = HashSet::new();
        for task in tasks {
            for class in task.await.unwrap() {
                assert!(seen.insert(class), "class ran twice");
            }
        }
        assert_eq!(seen.len(), classes.len());

        let snapshot = wait(&dispatcher).await;
        assert_eq!(snapshot.results.len(), classes.len());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fork_crash_mid_class() {
        testfork_common::testing::init_test_logging();
        let (addr, dispatcher) = start_server(&["A", "B"], ReclaimPolicy::Leave).await;

        let mut crashing = connect(addr, 0).await;
        write_message_async(
            &mut crashing,
            &ControlMessage::RequestNextClass {
                fork_id: ForkId::new(0),
            },
        )
        .await
        .unwrap();
        assert_eq!(
            recv(&mut crashing).await,
            Some(ControlMessage::execute_class("A"))
        );
        drop(crashing);

        let healthy = connect(addr, 1).await;
        assert_eq!(run_fork(healthy, 1).await, vec!["B"]);

        // The crash is observed asynchronously.
        let mut snapshot = dispatcher.snapshot();
        for _ in 0..100 {
            if snapshot.forks.get(&ForkId::new(0)) == Some(&ForkState::Crashed)
                && snapshot.forks.get(&ForkId::new(1)) == Some(&ForkState::Stopped)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            snapshot = dispatcher.snapshot();
        }
        assert_eq!(snapshot.forks[&ForkId::new(0)], ForkState::Crashed);
        assert_eq!(snapshot.in_flight.get("A"), Some(&ForkId::new(0)));
        assert_eq!(snapshot.results["B"], ClassOutcome::Pass);
        assert!(!dispatcher.is_complete());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_malformed_frame_skipped() {
        let (addr, dispatcher) = start_server(&["A"], ReclaimPolicy::Leave).await;
        let mut stream = connect(addr, 0).await;

        let garbage = b"{\"type\":\"launch_rockets\"}";
        let mut frame = (garbage.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(garbage);
        stream.write_all(&frame).await.unwrap();

        assert_eq!(run_fork(stream, 0).await, vec!["A"]);
        wait(&dispatcher).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_handshake_required() {
        let (addr, dispatcher) = start_server(&["A"], ReclaimPolicy::Leave).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_message_async(
            &mut stream,
            &ControlMessage::RequestNextClass {
                fork_id: ForkId::new(0),
            },
        )
        .await
        .unwrap();

        let closed = tokio::time::timeout(Duration::from_secs(5), read_message_async(&mut stream))
            .await
            .expect("server should close the connection");
        assert!(matches!(closed, Ok(None) | Err(_)));
        assert!(dispatcher.snapshot().forks.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_all_delivers_stop_fork() {
        let (addr, dispatcher) = start_server(&["A"], ReclaimPolicy::Leave).await;
        let mut stream = connect(addr, 0).await;

        for _ in 0..100 {
            if !dispatcher.snapshot().forks.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(dispatcher.stop_all(), 1);
        assert_eq!(recv(&mut stream).await, Some(ControlMessage::StopFork));
    }
}
