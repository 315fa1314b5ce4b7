//! Fork-side handling of control messages from the server.

use crate::connector::MessageSender;
use crate::queue::{Flow, HandlerError, MessageHandler, StopReason};
use crate::sandbox::TestRunner;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use testfork_common::{ControlMessage, ForkId};
use tracing::{info, warn};

/// Binds inbound control messages to the sandbox runner.
///
/// Runs only on the consumer thread, so classes execute one at a time.
pub struct ForkMessageDispatcher<R: TestRunner> {
    fork_id: ForkId,
    runner: R,
    sender: MessageSender,
    executed: usize,
}

impl<R: TestRunner> ForkMessageDispatcher<R> {
    pub fn new(fork_id: ForkId, runner: R, sender: MessageSender) -> Self {
        Self {
            fork_id,
            runner,
            sender,
            executed: 0,
        }
    }

    /// Classes run so far.
    pub fn executed(&self) -> usize {
        self.executed
    }

    fn execute(&mut self, class_name: String) -> Result<Flow, HandlerError> {
        info!("Executing class {}", class_name);
        let runner = &mut self.runner;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| runner.run_class(&class_name)))
            .map_err(|payload| HandlerError::Sandbox {
                class_name: class_name.clone(),
                reason: panic_message(payload.as_ref()),
            })?;
        self.executed += 1;
        info!("Class {} finished: {}", class_name, outcome);

        self.sender
            .send(&ControlMessage::class_completed(class_name, outcome))?;
        self.sender.send(&ControlMessage::RequestNextClass {
            fork_id: self.fork_id,
        })?;
        Ok(Flow::Continue)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "runner panicked".to_string()
    }
}

impl<R: TestRunner> MessageHandler for ForkMessageDispatcher<R> {
    fn handle(&mut self, message: ControlMessage) -> Result<Flow, HandlerError> {
        match message {
            ControlMessage::ExecuteClass { class_name } => self.execute(class_name),
            ControlMessage::NoMoreWork => {
                info!("No more work after {} classes", self.executed);
                Ok(Flow::Stop(StopReason::NoMoreWork))
            }
            ControlMessage::StopFork => {
                info!("Stop requested by control server");
                Ok(Flow::Stop(StopReason::StopRequested))
            }
            other => {
                warn!("Ignoring unexpected {} from control server", other.kind());
                Ok(Flow::Continue)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use std::sync::{Arc, Mutex};
    use testfork_common::{ClassOutcome, PipelineId, read_message};

    /// Writer whose bytes stay inspectable after being handed to a sender.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn messages(&self) -> Vec<ControlMessage> {
            let bytes = self.0.lock().unwrap().clone();
            let mut cursor = Cursor::new(bytes);
            let mut out = Vec::new();
            while let Some(msg) = read_message(&mut cursor).unwrap() {
                out.push(msg);
            }
            out
        }
    }

    struct ScriptedRunner {
        ran: Vec<String>,
    }

    impl TestRunner for ScriptedRunner {
        fn run_class(&mut self, class_name: &str) -> ClassOutcome {
            self.ran.push(class_name.to_string());
            if class_name.starts_with("bad") {
                ClassOutcome::Fail
            } else {
                ClassOutcome::Pass
            }
        }
    }

    fn dispatcher() -> (ForkMessageDispatcher<ScriptedRunner>, SharedBuf) {
        let buf = SharedBuf::default();
        let sender = MessageSender::new(buf.clone());
        let runner = ScriptedRunner { ran: Vec::new() };
        (ForkMessageDispatcher::new(ForkId::new(2), runner, sender), buf)
    }

    #[test]
    fn test_execute_class_reports_then_requests_next() {
        let (mut dispatcher, buf) = dispatcher();
        let flow = dispatcher
            .handle(ControlMessage::execute_class("bad_math"))
            .unwrap();
        assert_eq!(flow, Flow::Continue);
        assert_eq!(dispatcher.executed(), 1);
        assert_eq!(dispatcher.runner.ran, vec!["bad_math"]);
        assert_eq!(
            buf.messages(),
            vec![
                ControlMessage::class_completed("bad_math", ClassOutcome::Fail),
                ControlMessage::RequestNextClass {
                    fork_id: ForkId::new(2)
                },
            ]
        );
    }

    #[test]
    fn test_stop_messages() {
        let (mut dispatcher, buf) = dispatcher();
        assert_eq!(
            dispatcher.handle(ControlMessage::NoMoreWork).unwrap(),
            Flow::Stop(StopReason::NoMoreWork)
        );
        assert_eq!(
            dispatcher.handle(ControlMessage::StopFork).unwrap(),
            Flow::Stop(StopReason::StopRequested)
        );
        assert!(buf.messages().is_empty());
    }

    #[test]
    fn test_unexpected_kind_is_ignored() {
        let (mut dispatcher, buf) = dispatcher();
        let flow = dispatcher
            .handle(ControlMessage::ForkStarted {
                pipeline_id: PipelineId::new(0),
                fork_id: ForkId::new(9),
            })
            .unwrap();
        assert_eq!(flow, Flow::Continue);
        assert_eq!(dispatcher.executed(), 0);
        assert!(buf.messages().is_empty());
    }

    #[test]
    fn test_runner_panic_is_handler_error() {
        struct Panicking;
        impl TestRunner for Panicking {
            fn run_class(&mut self, _: &str) -> ClassOutcome {
                panic!("sandbox blew up");
            }
        }

        let buf = SharedBuf::default();
        let mut dispatcher =
            ForkMessageDispatcher::new(ForkId::new(1), Panicking, MessageSender::new(buf.clone()));
        let err = dispatcher
            .handle(ControlMessage::execute_class("A"))
            .unwrap_err();
        match err {
            HandlerError::Sandbox { class_name, reason } => {
                assert_eq!(class_name, "A");
                assert_eq!(reason, "sandbox blew up");
            }
            other => panic!("expected sandbox error, got {other:?}"),
        }
        assert!(buf.messages().is_empty());
    }

    #[test]
    fn test_send_failure_is_handler_error() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
            }
        }

        let runner = ScriptedRunner { ran: Vec::new() };
        let mut dispatcher =
            ForkMessageDispatcher::new(ForkId::new(1), runner, MessageSender::new(Broken));
        let err = dispatcher
            .handle(ControlMessage::execute_class("A"))
            .unwrap_err();
        assert!(matches!(err, HandlerError::Transport(_)));
    }
}
