use embedded_time::duration::Milliseconds;
use embedded_time::Instant;

/// A duration, in milliseconds
pub type Millis = Milliseconds<u64>;

/// Supertrait of [`embedded_time::Clock`] pinning the
/// type of "ticks" to u64, and requiring that the clock
/// can be shared with timer tasks.
pub trait Clock: embedded_time::Clock<T = u64> + core::fmt::Debug + Send + Sync + 'static {}
impl<C: embedded_time::Clock<T = u64> + core::fmt::Debug + Send + Sync + 'static> Clock for C {}

/// How much time passed between `then` and `now`
///
/// Yields zero when `now` is before `then`, or when the
/// elapsed time doesn't fit in milliseconds.
pub fn millis_since<C: Clock>(then: Instant<C>, now: Instant<C>) -> Millis {
  now.checked_duration_since(&then)
     .and_then(|d| Millis::try_from(d).ok())
     .unwrap_or(Milliseconds(0))
}

/// Milliseconds since the clock's epoch
pub fn millis_since_epoch<C: Clock>(now: Instant<C>) -> u64 {
  Millis::try_from(now.duration_since_epoch()).map(|Milliseconds(ms)| ms)
                                              .unwrap_or(0)
}

/// Convert to a [`core::time::Duration`] for the runtime
pub fn to_duration(Milliseconds(ms): Millis) -> core::time::Duration {
  core::time::Duration::from_millis(ms)
}

/// Data associated with a timestamp
pub struct Stamped<C: Clock, T>(pub T, pub Instant<C>);

impl<C: Clock, T: core::fmt::Debug> core::fmt::Debug for Stamped<C, T> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_tuple("Stamped")
     .field(&self.0)
     .field(&format_args!("<{}ms since epoch>", millis_since_epoch(self.1)))
     .finish()
  }
}

impl<C: Clock, T: PartialEq> PartialEq for Stamped<C, T> {
  fn eq(&self, other: &Self) -> bool {
    self.0 == other.0 && self.1 == other.1
  }
}

impl<C: Clock, T: Eq> Eq for Stamped<C, T> {}

impl<C: Clock, T: Clone> Clone for Stamped<C, T> {
  fn clone(&self) -> Self {
    Self(self.0.clone(), self.1)
  }
}

impl<C: Clock, T: Copy> Copy for Stamped<C, T> {}

impl<C: Clock, T> Stamped<C, T> {
  /// Get the data
  pub fn data(&self) -> &T {
    &self.0
  }

  /// Get the timestamp
  pub fn time(&self) -> Instant<C> {
    self.1
  }

  /// Discard the timestamp, yielding the data
  pub fn discard_timestamp(self) -> T {
    self.0
  }

  /// Map the data, keeping the timestamp
  pub fn map<R>(self, f: impl FnOnce(T) -> R) -> Stamped<C, R> {
    Stamped(f(self.0), self.1)
  }

  /// Of two stamped values, pick the one with the earliest timestamp
  pub fn find_oldest(winner: Option<Stamped<C, T>>, cur: Stamped<C, T>) -> Option<Stamped<C, T>> {
    Some(winner.filter(|winner| winner.time() <= cur.time())
               .unwrap_or(cur))
  }
}
