//! Client-side state for an observation (RFC7641).
//!
//! Notifications may arrive out of order. Each carries a 24-bit
//! sequence number, and a notification is only delivered when it
//! is _fresher_ than the last one delivered.

use embedded_time::duration::Milliseconds;
use embedded_time::Instant;

use crate::time::{millis_since, Clock, Millis, Stamped};

/// Half of the 24-bit sequence number space
const HALF: u32 = 1 << 23;

/// After this long without a notification, the next
/// notification is considered fresh no matter its sequence number
pub const FRESHNESS_HORIZON: Millis = Milliseconds(128_000);

/// Is sequence number `next` newer than `last`? (RFC7641 section 3.4)
///
/// ```
/// use toad_exchange::observe::is_fresher;
///
/// assert!(is_fresher(5, 6));
/// assert!(!is_fresher(5, 3));
/// assert!(!is_fresher(5, 5));
///
/// // wrapped around
/// assert!(is_fresher(0xFF_FFFF, 2));
/// ```
pub fn is_fresher(last: u32, next: u32) -> bool {
  (last < next && next - last < HALF) || (last > next && last - next > HALF)
}

/// Whether a notification should be delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
  /// Newer than anything seen so far
  Fresh,
  /// Reordered or duplicated; drop it
  Stale {
    /// The sequence number of the last delivered notification
    last: u32,
  },
}

/// Freshness state of a single observation
pub struct Observation<C: Clock> {
  last: Option<Stamped<C, u32>>,
}

impl<C: Clock> core::fmt::Debug for Observation<C> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Observation").field("last", &self.last).finish()
  }
}

impl<C: Clock> Default for Observation<C> {
  fn default() -> Self {
    Self { last: None }
  }
}

impl<C: Clock> Clone for Observation<C> {
  fn clone(&self) -> Self {
    Self { last: self.last }
  }
}

impl<C: Clock> Observation<C> {
  /// An observation that has not seen any notifications yet
  pub fn new() -> Self {
    Self::default()
  }

  /// Sequence number of the last delivered notification
  pub fn last(&self) -> Option<u32> {
    self.last.map(Stamped::discard_timestamp)
  }

  /// A notification with sequence number `seq` arrived at `now`.
  ///
  /// When it's fresh, `seq` becomes the last delivered sequence number.
  /// Otherwise nothing changes.
  pub fn offer(&mut self, seq: u32, now: Instant<C>) -> Verdict {
    let verdict = match self.last {
      | None => Verdict::Fresh,
      | Some(Stamped(last, at)) => {
        if is_fresher(last, seq) || millis_since(at, now) > FRESHNESS_HORIZON {
          Verdict::Fresh
        } else {
          Verdict::Stale { last }
        }
      },
    };

    if verdict == Verdict::Fresh {
      self.last = Some(Stamped(seq, now));
    }

    verdict
  }
}
