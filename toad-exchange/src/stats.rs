use core::sync::atomic::{AtomicU64, Ordering};

/// Something unexpected that the exchange layer tolerated
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Anomaly {
  /// A response, ACK or RST arrived for an exchange
  /// that is not in the dispatch table (late duplicate, or a bug)
  MissingDispatchEntry,
  /// A token was registered while already registered
  DuplicateRegistration,
  /// A token could not be released because it was not owned
  TokenNotReturned,
  /// A message id could not be released because it was not in flight
  MessageIdNotReturned,
  /// An observe notification arrived out of order
  StaleNotification,
  /// An inbound message that fits no known pattern
  UnclassifiableMessage,
  /// An inbound message we already processed
  Duplicate,
  /// A callback or request handler panicked
  CallbackPanicked,
  /// The transport refused to send a message
  TransportFailed,
}

impl Anomaly {
  /// Every kind of anomaly
  pub const ALL: [Anomaly; 9] = [Anomaly::MissingDispatchEntry,
                                 Anomaly::DuplicateRegistration,
                                 Anomaly::TokenNotReturned,
                                 Anomaly::MessageIdNotReturned,
                                 Anomaly::StaleNotification,
                                 Anomaly::UnclassifiableMessage,
                                 Anomaly::Duplicate,
                                 Anomaly::CallbackPanicked,
                                 Anomaly::TransportFailed];
}

/// Counters of [`Anomaly`]s
#[derive(Debug, Default)]
pub struct Stats {
  counts: [AtomicU64; 9],
}

impl Stats {
  /// Count an occurrence of `a`
  pub fn record(&self, a: Anomaly) {
    self.counts[a as usize].fetch_add(1, Ordering::Relaxed);
  }

  /// How many times `a` occurred
  pub fn get(&self, a: Anomaly) -> u64 {
    self.counts[a as usize].load(Ordering::Relaxed)
  }

  /// Every anomaly with a nonzero count
  pub fn snapshot(&self) -> Vec<(Anomaly, u64)> {
    Anomaly::ALL.iter()
                .map(|a| (*a, self.get(*a)))
                .filter(|(_, n)| *n > 0)
                .collect()
  }
}
