use std::collections::BTreeMap;

use toad_msg::{Id, Token};
use toad_stem::Stem;

use crate::msg::OBSERVE_MAX;
use crate::net::{Addrd, TokenBytes};

/// A remote endpoint that asked to be told when
/// a resource of ours changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
  path: String,
  seq: u32,
  last_id: Option<Id>,
}

impl Subscription {
  /// Path of the observed resource
  pub fn path(&self) -> &str {
    &self.path
  }

  /// Sequence number of the latest notification (or of the
  /// response to the registration, if nothing was sent since)
  pub fn seq(&self) -> u32 {
    self.seq
  }

  /// Message id of the latest notification
  pub fn last_id(&self) -> Option<Id> {
    self.last_id
  }
}

/// A notification that should be sent, yielded by [`Subscribers::due`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Due {
  /// Subscriber's token and address
  pub key: Addrd<Token>,
  /// Sequence number to send
  pub seq: u32,
  /// Id of the previous notification to this subscriber
  pub superseded: Option<Id>,
}

#[derive(Debug, Default)]
struct Table {
  subs: BTreeMap<Addrd<TokenBytes>, Subscription>,
  by_id: BTreeMap<Addrd<Id>, Addrd<TokenBytes>>,
}

impl Table {
  fn remove(&mut self, key: &Addrd<TokenBytes>) -> Option<Subscription> {
    let sub = self.subs.remove(key)?;
    if let Some(id) = sub.last_id {
      self.by_id.remove(&Addrd(id, key.addr()));
    }
    Some(sub)
  }
}

/// Observers of our resources, keyed by the token
/// they registered with and their address.
///
/// ```
/// use toad_exchange::net::Addrd;
/// use toad_exchange::subscribe::Subscribers;
/// use toad_msg::{Id, Token};
///
/// let subs = Subscribers::new();
/// let client = "10.0.0.2:5683".parse().unwrap();
/// let key = Addrd(Token(Default::default()), client);
///
/// assert_eq!(subs.subscribe(key, "temp"), 0);
///
/// let due = subs.due("temp");
/// assert_eq!(due.len(), 1);
/// assert_eq!(due[0].seq, 1);
///
/// subs.notified_with(key, Id(7));
/// assert_eq!(subs.remove_notified(Addrd(Id(7), client)), Some(key));
/// assert!(subs.is_empty());
/// ```
#[derive(Debug)]
pub struct Subscribers {
  table: Stem<Table>,
}

impl Default for Subscribers {
  fn default() -> Self {
    Self { table: Stem::new(Table::default()) }
  }
}

impl Subscribers {
  /// Create an empty table
  pub fn new() -> Self {
    Self::default()
  }

  /// `key` registered interest in `path`.
  ///
  /// Yields the sequence number the response to the registration
  /// should carry. Registering again with the same token keeps
  /// counting from where the earlier registration left off.
  pub fn subscribe(&self, key: Addrd<Token>, path: &str) -> u32 {
    let seq = self.table.map_mut(|t| match t.subs.get_mut(&key.key()) {
                          | Some(sub) => {
                            sub.path = path.to_string();
                            sub.seq = (sub.seq + 1) & OBSERVE_MAX;
                            sub.seq
                          },
                          | None => {
                            t.subs.insert(key.key(),
                                          Subscription { path: path.to_string(),
                                                         seq: 0,
                                                         last_id: None });
                            0
                          },
                        });

    log::debug!("{} observing {:?} with {:?}", key.addr(), path, key.data());
    seq
  }

  /// Forget the subscription of `key`
  pub fn unsubscribe(&self, key: Addrd<Token>) -> bool {
    self.table.map_mut(|t| t.remove(&key.key())).is_some()
  }

  /// `path` changed; advance the sequence number of every
  /// subscription to it, yielding the notifications to send.
  pub fn due(&self, path: &str) -> Vec<Due> {
    self.table.map_mut(|t| {
                t.subs
                 .iter_mut()
                 .filter(|(_, sub)| sub.path == path)
                 .map(|(key, sub)| {
                   sub.seq = (sub.seq + 1) & OBSERVE_MAX;
                   Due { key: Addrd(Token(key.0), key.addr()),
                         seq: sub.seq,
                         superseded: sub.last_id }
                 })
                 .collect()
              })
  }

  /// The latest notification to `key` was sent with id `id`.
  ///
  /// An ACK or RST for `id` will be matched to the subscription
  /// until the next notification is sent.
  pub fn notified_with(&self, key: Addrd<Token>, id: Id) {
    let tk = key.key();
    self.table.map_mut(|t| {
                let sub = match t.subs.get_mut(&tk) {
                  | Some(sub) => sub,
                  | None => return,
                };

                if let Some(old) = sub.last_id.replace(id) {
                  t.by_id.remove(&Addrd(old, tk.addr()));
                }
                t.by_id.insert(Addrd(id, tk.addr()), tk);
              });
  }

  /// Is `id` the latest notification sent to a subscriber?
  pub fn is_notification(&self, id: Addrd<Id>) -> bool {
    self.table.map_ref(|t| t.by_id.contains_key(&id))
  }

  /// The notification `id` was acknowledged; stop matching on it
  pub fn acknowledged(&self, id: Addrd<Id>) -> bool {
    self.table.map_mut(|t| {
                let key = match t.by_id.remove(&id) {
                  | Some(key) => key,
                  | None => return false,
                };

                if let Some(sub) = t.subs.get_mut(&key) {
                  sub.last_id = None;
                }
                true
              })
  }

  /// Remove the subscriber whose latest notification was `id`
  /// (because it was rejected, or never acknowledged)
  pub fn remove_notified(&self, id: Addrd<Id>) -> Option<Addrd<Token>> {
    self.table.map_mut(|t| {
                let key = t.by_id.get(&id).copied()?;
                t.remove(&key).map(|_| Addrd(Token(key.0), key.addr()))
              })
  }

  /// The subscription of `key`
  pub fn get(&self, key: Addrd<Token>) -> Option<Subscription> {
    self.table.map_ref(|t| t.subs.get(&key.key()).cloned())
  }

  /// Number of subscribers to `path`
  pub fn observing(&self, path: &str) -> usize {
    self.table
        .map_ref(|t| t.subs.values().filter(|sub| sub.path == path).count())
  }

  /// Forget every subscription
  pub fn clear(&self) -> usize {
    self.table.map_mut(|t| {
                let n = t.subs.len();
                *t = Table::default();
                n
              })
  }

  /// Number of subscriptions
  pub fn len(&self) -> usize {
    self.table.map_ref(|t| t.subs.len())
  }

  /// Is nobody subscribed?
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
