use std::collections::BTreeMap;

use embedded_time::Instant;
use toad_msg::Id;
use toad_stem::Stem;

use crate::msg::Message;
use crate::net::Addrd;
use crate::time::{millis_since, Clock, Millis, Stamped};

/// Result of [`Seen::check`]
#[derive(Debug, Clone, PartialEq)]
pub enum Check {
  /// First time we've seen this message
  New,
  /// We've seen this message before, and replied with this
  Duplicate(Option<Message>),
}

/// Remembers inbound CON & NON messages for `EXCHANGE_LIFETIME`,
/// along with what we replied to them, so that retransmissions from
/// the remote endpoint are not processed twice.
pub struct Seen<C: Clock> {
  lifetime: Millis,
  seen: Stem<BTreeMap<Addrd<Id>, Stamped<C, Option<Message>>>>,
}

impl<C: Clock> core::fmt::Debug for Seen<C> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Seen")
     .field("lifetime", &self.lifetime)
     .field("seen", &self.seen)
     .finish()
  }
}

impl<C: Clock> Seen<C> {
  /// Forget messages `lifetime` after they were first seen
  pub fn new(lifetime: Millis) -> Self {
    Self { lifetime,
           seen: Stem::new(BTreeMap::new()) }
  }

  /// A message with id `id` arrived at `now`; have we seen it before?
  pub fn check(&self, id: Addrd<Id>, now: Instant<C>) -> Check {
    let lifetime = self.lifetime;

    self.seen.map_mut(|seen| {
               seen.retain(|_, s| millis_since(s.time(), now) < lifetime);

               match seen.get(&id) {
                 | Some(s) => Check::Duplicate(s.data().clone()),
                 | None => {
                   seen.insert(id, Stamped(None, now));
                   Check::New
                 },
               }
             })
  }

  /// Remember that we replied to the message with id `id` with `reply`
  pub fn replied(&self, id: Addrd<Id>, reply: Message) {
    let mut reply = Some(reply);
    self.seen.map_mut(|seen| {
               if let Some(s) = seen.get_mut(&id) {
                 s.0 = reply.take();
               }
             });
  }

  /// Number of messages remembered
  pub fn len(&self) -> usize {
    self.seen.map_ref(|seen| seen.len())
  }

  /// Is nothing remembered?
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Forget everything
  pub fn clear(&self) {
    self.seen.map_mut(|seen| seen.clear());
  }
}
