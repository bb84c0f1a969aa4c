//! Pluggable consumers for a supervised process's stdout.

use super::exit::ProcessExit;

/// Receives the transcoder's stdout and its termination.
///
/// The supervisor owns the lifecycle; what the bytes mean is up to the
/// strategy. Chunks arrive strictly in pipe order and `on_exit` is called
/// exactly once, after the last chunk that will ever be delivered.
/// `on_stop` may come earlier, when the stop is requested.
pub trait OutputStrategy: Send + Sync + 'static {
    /// Called for every read from stdout.
    fn on_stdout(&self, chunk: &[u8]);

    /// Called when `stop` is requested, before any signal is sent. The
    /// process may keep running until the forced kill.
    fn on_stop(&self) {}

    /// Called once the process has terminated.
    fn on_exit(&self, exit: &ProcessExit);
}
