//! Process channel handed out by [`Substrate::exec`](crate::Substrate::exec).

use std::fmt;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

/// Releases the substrate side of a channel when dropped.
pub struct CloseGuard(Option<Box<dyn FnOnce() + Send>>);

impl CloseGuard {
    pub fn new(on_close: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(on_close)))
    }

    /// Release now instead of at drop.
    pub fn close(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl fmt::Debug for CloseGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CloseGuard")
            .field(&self.0.is_some())
            .finish()
    }
}

/// Bidirectional byte channel to a running process.
///
/// Dropping `input` closes the process's stdin. `output` yields stdout and
/// stderr chunks in arrival order and ends when the process exits. `exit`
/// resolves to the exit code. The process is killed once the guard drops.
#[derive(Debug)]
pub struct ProcessChannel {
    pub input: mpsc::Sender<Bytes>,
    pub output: mpsc::Receiver<Bytes>,
    pub exit: oneshot::Receiver<i32>,
    pub guard: CloseGuard,
}
