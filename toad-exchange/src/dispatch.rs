use std::collections::BTreeMap;
use std::sync::Arc;

use embedded_time::Instant;
use toad_msg::Token;
use toad_stem::Stem;

use crate::callback::Callback;
use crate::net::{Addrd, TokenBytes};
use crate::observe::{Observation, Verdict};
use crate::time::{Clock, Stamped};

/// An exchange waiting for a response
pub struct Entry<C: Clock> {
  token: Token,
  callback: Stamped<C, Arc<Callback>>,
  observe: Option<Observation<C>>,
}

impl<C: Clock> core::fmt::Debug for Entry<C> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Entry")
     .field("token", &self.token)
     .field("callback", &self.callback)
     .field("observe", &self.observe)
     .finish()
  }
}

impl<C: Clock> Entry<C> {
  /// The callback of the exchange
  pub fn callback(&self) -> &Arc<Callback> {
    self.callback.data()
  }

  /// When the exchange was registered
  pub fn created(&self) -> Instant<C> {
    self.callback.time()
  }

  /// Is this an observation?
  pub fn is_observation(&self) -> bool {
    self.observe.is_some()
  }

  /// Sequence number of the last delivered notification
  pub fn last_notification(&self) -> Option<u32> {
    self.observe.as_ref().and_then(Observation::last)
  }
}

/// Outcome of [`Dispatch::notify`]
#[derive(Debug)]
pub enum Notified {
  /// The notification is fresh; deliver it to this callback
  Deliver(Arc<Callback>),
  /// The notification is older than one we delivered
  Stale {
    /// The sequence number of the last delivered notification
    last: u32,
  },
  /// Nobody is waiting for a response with this token
  Missing,
}

/// The response dispatch table.
///
/// Maps remote endpoint + token to the callback of the
/// exchange that owns the token.
///
/// Every operation locks the table exactly once, so two
/// operations on the same key never interleave.
/// Callbacks are handed out as [`Arc`]s and must be
/// invoked by the caller, after the table is unlocked.
pub struct Dispatch<C: Clock> {
  entries: Stem<BTreeMap<Addrd<TokenBytes>, Entry<C>>>,
}

impl<C: Clock> core::fmt::Debug for Dispatch<C> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Dispatch")
     .field("entries", &self.entries)
     .finish()
  }
}

impl<C: Clock> Default for Dispatch<C> {
  fn default() -> Self {
    Self { entries: Stem::new(BTreeMap::new()) }
  }
}

impl<C: Clock> Dispatch<C> {
  /// Create an empty table
  pub fn new() -> Self {
    Self::default()
  }

  /// Register the callback of an exchange.
  ///
  /// When `observe` is true the entry survives successful
  /// notifications, and tracks their freshness.
  ///
  /// Tokens are allocated before they are registered, so an
  /// occupied key means something went wrong; the old entry is
  /// replaced, an error is logged and the displaced callback is returned.
  pub fn register(&self,
                  key: Addrd<Token>,
                  callback: Arc<Callback>,
                  now: Instant<C>,
                  observe: bool)
                  -> Option<Arc<Callback>> {
    let mut entry = Some(Entry { token: *key.data(),
                                 callback: Stamped(callback, now),
                                 observe: if observe { Some(Observation::new()) } else { None } });

    let displaced = self.entries
                        .map_mut(|entries| entries.insert(key.key(), entry.take()?))
                        .map(|e| e.callback.discard_timestamp());

    if displaced.is_some() {
      log::error!("{:?} registered for {} while it was already in use",
                  key.data(),
                  key.addr());
    }

    displaced
  }

  /// Get the callback waiting on `key`
  pub fn lookup(&self, key: Addrd<Token>) -> Option<Arc<Callback>> {
    self.entries
        .map_ref(|entries| entries.get(&key.key()).map(|e| e.callback().clone()))
  }

  /// Is `key` an observation?
  pub fn is_observation(&self, key: Addrd<Token>) -> bool {
    self.entries.map_ref(|entries| {
                  entries.get(&key.key())
                         .map(Entry::is_observation)
                         .unwrap_or(false)
                })
  }

  /// Remove the entry for `key`, yielding its callback
  pub fn remove(&self, key: Addrd<Token>) -> Option<Arc<Callback>> {
    self.entries
        .map_mut(|entries| entries.remove(&key.key()))
        .map(|e| e.callback.discard_timestamp())
  }

  /// A successful notification with sequence number `seq` arrived for `key`.
  ///
  /// The entry stays in place. Entries that were not registered
  /// as observations start observing with this notification.
  pub fn notify(&self, key: Addrd<Token>, seq: u32, now: Instant<C>) -> Notified {
    self.entries.map_mut(|entries| {
                  let entry = match entries.get_mut(&key.key()) {
                    | Some(e) => e,
                    | None => return Notified::Missing,
                  };

                  match entry.observe
                             .get_or_insert_with(Observation::new)
                             .offer(seq, now)
                  {
                    | Verdict::Fresh => Notified::Deliver(entry.callback().clone()),
                    | Verdict::Stale { last } => Notified::Stale { last },
                  }
                })
  }

  /// Remove every entry
  pub fn drain(&self) -> Vec<(Addrd<Token>, Arc<Callback>)> {
    self.entries
        .map_mut(|entries| core::mem::take(entries))
        .into_iter()
        .map(|(key, e)| (Addrd(e.token, key.addr()), e.callback.discard_timestamp()))
        .collect()
  }

  /// Number of exchanges waiting for a response
  pub fn len(&self) -> usize {
    self.entries.map_ref(|entries| entries.len())
  }

  /// Is nobody waiting for a response?
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
