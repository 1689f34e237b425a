use embedded_time::duration::Milliseconds;

use crate::retry::{Attempts, Strategy};
use crate::time::Millis;

/// Configuration options related to outbound CON messages
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Con {
  /// Retry strategy for CON messages that
  /// have not yet been ACKed.
  ///
  /// Defaults to an exponential retry strategy with an
  /// initial timeout between `ACK_TIMEOUT` and
  /// `ACK_TIMEOUT * ACK_RANDOM_FACTOR` (RFC7252 section 4.8):
  /// ```
  /// use embedded_time::duration::Milliseconds;
  /// use toad_exchange::config::Con;
  /// use toad_exchange::retry::Strategy;
  ///
  /// assert_eq!(Con::default().retry_strategy,
  ///            Strategy::Exponential { init_min: Milliseconds(2_000),
  ///                                    init_max: Milliseconds(3_000) });
  /// ```
  pub retry_strategy: Strategy,
  /// Number of times we are allowed to resend a CON message
  /// before giving up.
  ///
  /// Defaults to 4 attempts.
  /// ```
  /// use toad_exchange::config::Con;
  /// use toad_exchange::retry::Attempts;
  ///
  /// assert_eq!(Con::default().max_attempts, Attempts(4));
  /// ```
  pub max_attempts: Attempts,
  /// Upper bound on a single wait between two transmissions
  /// of the same message, no matter how many times
  /// the timeout has doubled.
  ///
  /// Defaults to 60 seconds.
  /// ```
  /// use embedded_time::duration::Milliseconds;
  /// use toad_exchange::config::Con;
  ///
  /// assert_eq!(Con::default().backoff_ceiling, Milliseconds(60_000u64));
  /// ```
  pub backoff_ceiling: Millis,
}

/// Configuration options related to allocating
/// tokens & message ids
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Msg {
  /// See [`Con`]
  pub con: Con,

  /// Number of tokens a single remote endpoint may own
  /// at once (outstanding requests + active observations).
  ///
  /// ```
  /// use toad_exchange::config::Msg;
  ///
  /// assert_eq!(Msg::default().token_limit, 256);
  /// ```
  pub token_limit: usize,

  /// Number of message ids that may be in flight
  /// to a single remote endpoint at once.
  ///
  /// RFC7252 recommends `NSTART = 1`, which this crate
  /// does not enforce by default.
  ///
  /// ```
  /// use toad_exchange::config::Msg;
  ///
  /// assert_eq!(Msg::default().message_id_limit, 1024);
  /// ```
  pub message_id_limit: usize,

  /// Seed mixed into the starting message id
  /// of every remote endpoint, making ids less guessable.
  ///
  /// The default value is 0, although it is
  /// best practice to set this to something else.
  /// (random integer, machine identifier)
  ///
  /// ```
  /// use toad_exchange::config::Msg;
  ///
  /// assert_eq!(Msg::default().id_seed, 0);
  /// ```
  pub id_seed: u64,
}

impl Default for Con {
  fn default() -> Self {
    Con { retry_strategy: Strategy::Exponential { init_min: Milliseconds(2_000),
                                                  init_max: Milliseconds(3_000) },
          max_attempts: Attempts(4),
          backoff_ceiling: Milliseconds(60_000) }
  }
}

impl Default for Msg {
  fn default() -> Self {
    Msg { con: Con::default(),
          token_limit: 256,
          message_id_limit: 1024,
          id_seed: 0 }
  }
}

/// Runtime config
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
  /// See [`Msg`]
  pub msg: Msg,
  /// Maximum number of inbound requests that
  /// may be handled at a given moment
  ///
  /// ```
  /// use toad_exchange::config::Config;
  ///
  /// assert_eq!(Config::default().max_concurrent_requests, 16);
  /// ```
  pub max_concurrent_requests: usize,
}

impl Default for Config {
  fn default() -> Self {
    Config { msg: Msg::default(),
             max_concurrent_requests: 16 }
  }
}

impl Config {
  /// `MAX_TRANSMIT_SPAN`: time from the first transmission
  /// of a CON message to its last retransmission
  pub fn max_transmit_span_millis(&self) -> u64 {
    let con = self.msg.con;
    let attempts = Attempts(con.max_attempts.0.saturating_sub(1));
    let span = con.retry_strategy.max_time(attempts, con.backoff_ceiling).0;

    if con.max_attempts.0 == 0 {
      0
    } else {
      span
    }
  }

  /// `MAX_TRANSMIT_WAIT`: time from the first transmission
  /// of a CON message to when we give up waiting for an ACK
  pub fn max_transmit_wait_millis(&self) -> u64 {
    let con = self.msg.con;
    con.retry_strategy
       .max_time(con.max_attempts, con.backoff_ceiling)
       .0
  }

  // TODO: adjust these on the fly based on actual timings?
  pub(crate) fn max_latency_millis(&self) -> u64 {
    100_000
  }

  pub(crate) fn expected_processing_delay_millis(&self) -> u64 {
    2_000
  }

  /// `EXCHANGE_LIFETIME`: how long a message id must be
  /// remembered after it was first seen
  pub fn exchange_lifetime_millis(&self) -> u64 {
    self.max_transmit_span_millis()
    + (2 * self.max_latency_millis())
    + self.expected_processing_delay_millis()
  }
}
