//! skiff-session: sessions bound to running workloads.
//!
//! Two families share one registry:
//!
//! - **Interactive** (exec, connect): bidirectional byte pipes. Each
//!   direction is bounded; a slow side makes the other wait, nothing is
//!   dropped.
//! - **Streams** (logs, metrics): numbered, best-effort. A consumer that
//!   falls behind loses the oldest entries and is told so with a gap event.
//!
//! Every session is registered under its workload id. The orchestrator
//! closes all of a workload's sessions through [`SessionRegistry`] (its
//! `SessionCloser`) before tearing the unit down, and waits until each
//! session has released its substrate channel.

pub mod error;
pub mod frame;
pub mod manager;
pub mod registry;

pub use error::{SessionError, SessionResult};
pub use frame::{CloseReason, SessionEvent, SessionKind, StreamEvent};
pub use manager::{ExecOutput, InteractiveSession, SessionManager, StreamSession};
pub use registry::{SessionId, SessionInfo, SessionRegistry};
