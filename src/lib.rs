//! abcored - Supervisor for a Tor proxy and a bitcoind/liquidd full node
//!
//! This library spawns the two daemons as a pair (Tor first, then the node),
//! drains their output, tears both down when either one dies, and reports
//! lifecycle events to the host.

pub mod config;
pub mod drain;
pub mod error;
pub mod notifier;
pub mod process;
pub mod readiness;
pub mod supervisor;

pub use config::{HostSettings, LaunchPlan, NodeVariant, SupervisorConfig, SupervisorOptions};
pub use drain::{DrainReport, StreamKind};
pub use error::{SpawnError, StartError};
pub use notifier::{ChannelNotifier, LifecycleEvent, LifecycleNotifier, StopReason, TracingNotifier};
pub use process::{ChildName, ChildProcess, ChildSpec, ChildStatus};
pub use readiness::ReadinessProbe;
pub use supervisor::{
    ChildSnapshot, StartOutcome, StopOutcome, Supervisor, SupervisorHandle, SupervisorState,
};
