use crate::time::Millis;

/// A handle to a job that may not have run yet
pub trait Cancel {
  /// Make sure the job never runs.
  ///
  /// Cancelling a job that already ran does nothing.
  fn cancel(&self);
}

/// Something that can run work later, or elsewhere.
///
/// Timers (retransmissions) are scheduled with [`Schedule::schedule`],
/// while potentially slow work (handling inbound requests)
/// is handed off with [`Schedule::execute`].
///
/// Neither method may run `job` on the calling thread before returning.
pub trait Schedule: Clone + Send + Sync + 'static {
  /// Handle to a scheduled job
  type Handle: Cancel + core::fmt::Debug + Send + Sync + 'static;

  /// Run `job` once `after` has elapsed
  fn schedule<F>(&self, after: Millis, job: F) -> Self::Handle
    where F: FnOnce() + Send + 'static;

  /// Run `job` as soon as there is capacity to do so
  fn execute<F>(&self, job: F)
    where F: FnOnce() + Send + 'static;
}

impl Cancel for tokio::task::JoinHandle<()> {
  fn cancel(&self) {
    self.abort()
  }
}
