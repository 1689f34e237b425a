use core::ops::RangeInclusive;

use embedded_time::duration::Milliseconds;
use rand::{Rng, SeedableRng};

use crate::time::Millis;

/// Retransmission state for a single outbound message.
///
/// It does not _contain_ the message being retried, nor does it
/// wait; it tells the owner how long to wait before the next
/// attempt, and when to give up.
///
/// Timeouts are measured from the initial transmission and the
/// window doubles after every retransmission, so a timer with an
/// initial timeout of 2 seconds asks for retransmissions at
/// 2s, 4s, 8s, 16s, ... after the message was first sent.
///
/// ```
/// use embedded_time::duration::Milliseconds;
/// use toad_exchange::retry::{Attempts, RetryTimer, Strategy, YouShould};
///
/// let strategy = Strategy::Exponential { init_min: Milliseconds(2_000),
///                                        init_max: Milliseconds(2_000) };
/// let mut timer = RetryTimer::new(strategy, Attempts(2), Milliseconds(60_000), 0);
///
/// assert_eq!(timer.first_delay(), Milliseconds(2_000u64));
/// assert_eq!(timer.what_should_i_do(),
///            YouShould::Retry { wait: Milliseconds(2_000) });
/// assert_eq!(timer.what_should_i_do(),
///            YouShould::Retry { wait: Milliseconds(4_000) });
/// assert_eq!(timer.what_should_i_do(), YouShould::Cry);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryTimer {
  init: Millis,
  window: Millis,
  ceiling: Millis,
  strategy: Strategy,
  attempts: Attempts,
  max_attempts: Attempts,
}

/// A number of attempts
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Attempts(pub u16);

/// Result of [`RetryTimer::what_should_i_do`].
///
/// This tells you if a retry should be attempted or not.
#[derive(PartialEq, Debug, Clone, Copy)]
pub enum YouShould {
  /// Attempts have been exhausted and the work that is
  /// being retried should be considered poisoned.
  Cry,
  /// Retry now, then ask again after `wait` has elapsed.
  Retry {
    /// How long to wait before asking again
    wait: Millis,
  },
}

impl RetryTimer {
  /// Create a new retry timer.
  ///
  /// `seed` is only used when `strategy` has jitter, to pick
  /// the initial timeout from the strategy's range.
  pub fn new(strategy: Strategy, max_attempts: Attempts, ceiling: Millis, seed: u64) -> Self {
    let init = if strategy.has_jitter() {
      let mut rand = rand_chacha::ChaCha8Rng::seed_from_u64(seed);
      Milliseconds(rand.gen_range(strategy.range()))
    } else {
      Milliseconds(*strategy.range().start())
    };

    let init = Milliseconds(init.0.max(1).min(ceiling.0.max(1)));

    Self { init,
           window: init,
           ceiling,
           strategy,
           attempts: Attempts(0),
           max_attempts }
  }

  /// How long to wait after the initial transmission
  /// before the first retransmission.
  pub fn first_delay(&self) -> Millis {
    self.init
  }

  /// Number of retransmissions performed so far
  pub fn attempts(&self) -> Attempts {
    self.attempts
  }

  /// Maximum number of retransmissions
  pub fn max_attempts(&self) -> Attempts {
    self.max_attempts
  }

  /// Time since the initial transmission at which the
  /// timer will next fire
  pub fn window(&self) -> Millis {
    self.window
  }

  /// The timer fired and no acknowledgement was seen;
  /// should the message be sent again?
  pub fn what_should_i_do(&mut self) -> YouShould {
    if self.attempts >= self.max_attempts {
      return YouShould::Cry;
    }

    self.attempts.0 += 1;

    let wait = match self.strategy {
      | Strategy::Delay { .. } => self.init,
      | Strategy::Exponential { .. } => Milliseconds(self.window.0.min(self.ceiling.0)),
    };

    self.window = Milliseconds(self.window.0.saturating_add(wait.0));
    YouShould::Retry { wait }
  }
}

/// Strategy to employ when retrying
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Strategy {
  /// Generate a random initial timeout between `init_min` and `init_max`,
  /// and double the timeout after each retransmission.
  Exponential {
    /// Minimum (inclusive) delay for second attempt
    init_min: Millis,
    /// Maximum (inclusive) delay for second attempt
    init_max: Millis,
  },
  /// Generate a random delay between `min` and `max`,
  /// and wait that long between every attempt.
  Delay {
    /// Minimum (inclusive) delay for attempts
    min: Millis,
    /// Maximum (inclusive) delay for attempts
    max: Millis,
  },
}

impl Strategy {
  /// Are min & max delays the same? if so, we should probably skip the random number generation.
  pub fn has_jitter(&self) -> bool {
    let rng = self.range();
    rng.start() != rng.end()
  }

  /// Get the min & max durations as an inclusive range
  pub fn range(&self) -> RangeInclusive<u64> {
    match self {
      | &Self::Delay { min: Milliseconds(min),
                       max: Milliseconds(max), } => (min..=max.max(min)),

      | &Self::Exponential { init_min: Milliseconds(min),
                             init_max: Milliseconds(max), } => (min..=max.max(min)),
    }
  }

  /// Time between the initial transmission and giving up
  /// when every attempt goes unanswered, assuming the
  /// longest possible initial timeout.
  pub fn max_time(&self, max_attempts: Attempts, ceiling: Millis) -> Millis {
    let worst = match self {
      | &Self::Exponential { init_max, .. } => Self::Exponential { init_min: init_max,
                                                                   init_max },
      | &Self::Delay { max, .. } => Self::Delay { min: max, max },
    };

    let mut timer = RetryTimer::new(worst, max_attempts, ceiling, 0);
    while let YouShould::Retry { .. } = timer.what_should_i_do() {}
    timer.window()
  }
}
