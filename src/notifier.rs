//! Lifecycle events reported to the host

use crate::drain::StreamKind;
use crate::process::ChildName;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Why the pair was stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// `stop()` was called
    Requested,
    /// A child exited on its own while it was expected to be running
    ChildExited { child: ChildName, code: Option<i32> },
    /// Every supervisor handle was dropped
    HostShutdown,
}

impl StopReason {
    /// True when the pair died instead of being asked to stop
    pub fn is_failure(&self) -> bool {
        matches!(self, StopReason::ChildExited { .. })
    }
}

/// State transitions and diagnostics published by the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Both children are running
    Started { version_label: String },
    /// A start request failed before reaching running; nothing is left behind
    StartFailed { step: ChildName, cause: String },
    /// A running pair was torn down
    Stopped { reason: StopReason },
    /// Last lines a child printed before one of its streams closed
    ErrorDigest {
        child: ChildName,
        stream: StreamKind,
        lines: Vec<String>,
        /// Why the stream ended early, if it did not reach end-of-stream
        read_error: Option<String>,
    },
}

/// Receives lifecycle events. Called from the supervisor task, so it must
/// not block.
pub trait LifecycleNotifier: Send + Sync {
    fn notify(&self, event: LifecycleEvent);
}

/// Forwards events to an unbounded channel
#[derive(Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl LifecycleNotifier for ChannelNotifier {
    fn notify(&self, event: LifecycleEvent) {
        // Receiver gone means the host stopped listening
        let _ = self.tx.send(event);
    }
}

/// Logs events; the status indicator of a headless host
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl LifecycleNotifier for TracingNotifier {
    fn notify(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Started { version_label } => {
                info!("✓ Node is running (Version {})", version_label);
            }
            LifecycleEvent::StartFailed { step, cause } => {
                error!("✗ Failed to start {}: {}", step, cause);
            }
            LifecycleEvent::Stopped { reason } if reason.is_failure() => {
                error!("✗ Node stopped unexpectedly: {:?}", reason);
            }
            LifecycleEvent::Stopped { reason } => {
                info!("Node stopped ({:?})", reason);
            }
            LifecycleEvent::ErrorDigest {
                child,
                stream,
                lines,
                read_error,
            } => {
                if let Some(cause) = read_error {
                    warn!("{} {} was not read to the end: {}", child, stream, cause);
                }
                if !lines.is_empty() {
                    warn!("{} {} ended with:\n{}", child, stream, lines.join("\n"));
                }
            }
        }
    }
}
