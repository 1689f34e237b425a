//! Running the exchange layer on tokio

use std::sync::Arc;

use embedded_time::rate::Fraction;
use embedded_time::Instant;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

use crate::config::Config;
use crate::core::Core;
use crate::net::Transport;
use crate::schedule::Schedule;
use crate::time::{to_duration, Millis};

/// A millisecond clock that starts at zero when created.
///
/// Reads [`tokio::time::Instant`], so it honors a paused
/// (test) runtime clock.
#[derive(Debug, Clone, Copy)]
pub struct Clock(tokio::time::Instant);

impl Clock {
  /// Create a clock whose epoch is now
  pub fn new() -> Self {
    Self(tokio::time::Instant::now())
  }
}

impl Default for Clock {
  fn default() -> Self {
    Self::new()
  }
}

impl embedded_time::Clock for Clock {
  type T = u64;

  const SCALING_FACTOR: Fraction = Fraction::new(1, 1_000);

  fn try_now(&self) -> Result<Instant<Self>, embedded_time::clock::Error> {
    let millis = u64::try_from(self.0.elapsed().as_millis()).map_err(|_| {
                                                              embedded_time::clock::Error::Unspecified
                                                            })?;
    Ok(Instant::new(millis))
  }
}

/// [`Schedule`] backed by a tokio runtime.
///
/// Timers are tasks sleeping on [`tokio::time::sleep`].
/// Jobs passed to [`Schedule::execute`] run on tokio's blocking
/// pool, at most `max_concurrent` at a time; jobs beyond that
/// wait for a permit.
#[derive(Debug, Clone)]
pub struct Scheduler {
  rt: Handle,
  permits: Arc<Semaphore>,
}

impl Scheduler {
  /// Create a scheduler that spawns onto `rt`
  pub fn new(rt: Handle, max_concurrent: usize) -> Self {
    Self { rt,
           permits: Arc::new(Semaphore::new(max_concurrent.max(1))) }
  }

  /// Create a scheduler that spawns onto the runtime
  /// we are currently running in, if any.
  pub fn current(max_concurrent: usize) -> Option<Self> {
    Handle::try_current().ok()
                         .map(|rt| Self::new(rt, max_concurrent))
  }

  /// Number of [`Schedule::execute`] jobs that could start right now
  pub fn available(&self) -> usize {
    self.permits.available_permits()
  }
}

impl Schedule for Scheduler {
  type Handle = tokio::task::JoinHandle<()>;

  fn schedule<F>(&self, after: Millis, job: F) -> Self::Handle
    where F: FnOnce() + Send + 'static
  {
    self.rt.spawn(async move {
             tokio::time::sleep(to_duration(after)).await;
             job()
           })
  }

  fn execute<F>(&self, job: F)
    where F: FnOnce() + Send + 'static
  {
    let permits = self.permits.clone();
    let rt = self.rt.clone();

    self.rt.spawn(async move {
             let permit = match permits.acquire_owned().await {
               | Ok(p) => p,
               | Err(_) => {
                 log::warn!("worker pool closed, dropping job");
                 return;
               },
             };

             let ran = rt.spawn_blocking(move || {
                           job();
                           drop(permit);
                         })
                         .await;

             if let Err(e) = ran {
               log::error!("worker job failed: {:?}", e);
             }
           });
  }
}

impl<T: Transport> Core<T, Scheduler, Clock> {
  /// Run the exchange layer on the tokio runtime we are
  /// currently in, handling at most
  /// [`Config::max_concurrent_requests`] inbound requests at once.
  ///
  /// Yields `None` outside of a tokio runtime.
  pub fn on_current_runtime(config: Config, transport: T) -> Option<Self> {
    Scheduler::current(config.max_concurrent_requests)
      .map(|sched| Core::new(config, Clock::new(), transport, sched))
  }
}
