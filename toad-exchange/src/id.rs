use std::collections::BTreeMap;
use std::net::SocketAddr;

use embedded_time::duration::Milliseconds;
use embedded_time::Instant;
use rand::{Rng, SeedableRng};
use toad_msg::Id;
use toad_stem::Stem;

use crate::time::{millis_since, millis_since_epoch, Clock, Millis, Stamped};

/// The remote endpoint has as many message ids in flight as it is
/// allowed to.
///
/// `retry_after` is how long until the oldest of them is
/// guaranteed to have finished; it is never zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoMessageIdAvailable {
  /// The remote endpoint
  pub addr: SocketAddr,
  /// How long the caller should wait before trying again
  pub retry_after: Millis,
}

struct Endpoint<C: Clock> {
  next: u16,
  in_flight: Vec<Stamped<C, Id>>,
  last_used: Instant<C>,
}

impl<C: Clock> core::fmt::Debug for Endpoint<C> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Endpoint")
     .field("next", &self.next)
     .field("in_flight", &self.in_flight)
     .field("last_used", &millis_since_epoch(self.last_used))
     .finish()
  }
}

/// Issues message [`Id`]s per remote endpoint.
///
/// Each endpoint gets a circular 16-bit counter, starting
/// at a pseudo-random point. Ids still in flight are skipped,
/// and `Id(0)` is never issued.
///
/// An id stays in flight until it is [released](IdAllocator::release),
/// which happens when the exchange using it terminates.
///
/// Endpoints with nothing in flight that have not been issued
/// an id for `idle` are forgotten.
pub struct IdAllocator<C: Clock> {
  limit: usize,
  seed: u64,
  max_transmit_wait: Millis,
  idle: Millis,
  endpoints: Stem<BTreeMap<SocketAddr, Endpoint<C>>>,
}

impl<C: Clock> core::fmt::Debug for IdAllocator<C> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("IdAllocator")
     .field("limit", &self.limit)
     .field("max_transmit_wait", &self.max_transmit_wait)
     .field("idle", &self.idle)
     .field("endpoints", &self.endpoints)
     .finish()
  }
}

impl<C: Clock> IdAllocator<C> {
  /// Create an allocator allowing `limit` ids in flight per endpoint.
  ///
  /// `max_transmit_wait` is the longest an exchange can stay in
  /// flight, and is used to compute [`NoMessageIdAvailable::retry_after`].
  ///
  /// `idle` is how long an endpoint with no ids in flight is remembered
  /// (usually `EXCHANGE_LIFETIME`).
  pub fn new(limit: usize, seed: u64, max_transmit_wait: Millis, idle: Millis) -> Self {
    Self { limit,
           seed,
           max_transmit_wait,
           idle,
           endpoints: Stem::new(BTreeMap::new()) }
  }

  /// Issue a message id for a message to `addr`
  pub fn allocate(&self, addr: SocketAddr, now: Instant<C>) -> Result<Id, NoMessageIdAvailable> {
    let (limit, seed, wait, idle) = (self.limit, self.seed, self.max_transmit_wait, self.idle);

    self.endpoints.map_mut(|endpoints| {
                    endpoints.retain(|a, ep| {
                               *a == addr
                               || !ep.in_flight.is_empty()
                               || millis_since(ep.last_used, now) < idle
                             });

                    let ep = endpoints.entry(addr).or_insert_with(|| {
                                                    let seed = seed ^ millis_since_epoch(now);
                                                    let mut rand = rand_chacha::ChaCha8Rng::seed_from_u64(seed);
                                                    Endpoint { next: rand.gen(),
                                                               in_flight: vec![],
                                                               last_used: now }
                                                  });
                    ep.last_used = now;

                    if ep.in_flight.len() >= limit.min(u16::MAX as usize) {
                      let oldest = ep.in_flight.iter().copied().fold(None, Stamped::find_oldest);
                      let elapsed = oldest.map(|o| millis_since(o.time(), now))
                                          .unwrap_or(Milliseconds(0));
                      let retry_after = Milliseconds(wait.0.saturating_sub(elapsed.0).max(1));

                      return Err(NoMessageIdAvailable { addr, retry_after });
                    }

                    loop {
                      ep.next = ep.next.wrapping_add(1);
                      let id = Id(ep.next);

                      if id != Id(0) && !ep.in_flight.iter().any(|s| *s.data() == id) {
                        ep.in_flight.push(Stamped(id, now));
                        break Ok(id);
                      }
                    }
                  })
  }

  /// Mark an id as no longer in flight, allowing it to be issued again.
  ///
  /// Returns `false` (and logs a warning) when the id was not in flight.
  pub fn release(&self, addr: SocketAddr, id: Id) -> bool {
    let released = self.endpoints.map_mut(|endpoints| {
                                   let ids = match endpoints.get_mut(&addr) {
                                     | Some(ep) => &mut ep.in_flight,
                                     | None => return false,
                                   };

                                   match ids.iter().position(|s| *s.data() == id) {
                                     | Some(ix) => {
                                       ids.swap_remove(ix);
                                       true
                                     },
                                     | None => false,
                                   }
                                 });

    if !released {
      log::warn!("{:?} released for {}, but it was not in flight", id, addr);
    }

    released
  }

  /// Number of ids in flight to `addr`
  pub fn in_flight(&self, addr: SocketAddr) -> usize {
    self.endpoints
        .map_ref(|eps| eps.get(&addr).map(|ep| ep.in_flight.len()).unwrap_or(0))
  }

  /// Is `id` in flight to `addr`?
  pub fn is_in_flight(&self, addr: SocketAddr, id: Id) -> bool {
    self.endpoints.map_ref(|eps| {
                    eps.get(&addr)
                       .map(|ep| ep.in_flight.iter().any(|s| *s.data() == id))
                       .unwrap_or(false)
                  })
  }

  /// Number of endpoints remembered
  pub fn endpoints(&self) -> usize {
    self.endpoints.map_ref(|eps| eps.len())
  }

  /// Release every id in flight to every endpoint
  pub fn release_all(&self) -> usize {
    self.endpoints.map_mut(|eps| {
                    let n = eps.values().map(|ep| ep.in_flight.len()).sum();
                    eps.values_mut().for_each(|ep| ep.in_flight.clear());
                    n
                  })
  }
}
