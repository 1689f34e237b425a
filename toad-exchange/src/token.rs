use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use embedded_time::Instant;
use toad_msg::Token;
use toad_stem::Stem;

use crate::net::TokenBytes;
use crate::time::{millis_since, millis_since_epoch, Clock, Millis};

/// Every token that could be issued to the remote
/// endpoint is currently owned by an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoTokenAvailable {
  /// The remote endpoint
  pub addr: SocketAddr,
  /// Number of tokens it owns
  pub in_use: usize,
}

struct Endpoint<C: Clock> {
  next: u64,
  in_use: BTreeSet<TokenBytes>,
  last_used: Instant<C>,
}

impl<C: Clock> core::fmt::Debug for Endpoint<C> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Endpoint")
     .field("next", &self.next)
     .field("in_use", &self.in_use)
     .field("last_used", &millis_since_epoch(self.last_used))
     .finish()
  }
}

/// Issues [`Token`]s that are unique per remote endpoint
/// for as long as they are owned.
///
/// Tokens are drawn from a counter (starting at 1) kept
/// for each endpoint, encoded big-endian using as few bytes
/// as the value needs. When the counter lands on a value
/// that is still owned by an earlier exchange, that value is skipped.
///
/// An endpoint that owns no tokens and has not been issued one
/// for `idle` is forgotten, and its counter starts over.
///
/// ```
/// use embedded_time::duration::Milliseconds;
/// use embedded_time::Clock as _;
/// use toad_exchange::runtime::Clock;
/// use toad_exchange::token::TokenAllocator;
///
/// let clock = Clock::new();
/// let tokens = TokenAllocator::<Clock>::new(2, Milliseconds(247_000));
/// let addr = "127.0.0.1:5683".parse().unwrap();
/// let now = clock.try_now().unwrap();
///
/// let a = tokens.allocate(addr, now).unwrap();
/// let b = tokens.allocate(addr, now).unwrap();
/// assert_eq!(a.0.as_slice(), &[1]);
/// assert_eq!(b.0.as_slice(), &[2]);
///
/// assert!(tokens.allocate(addr, now).is_err());
/// assert!(tokens.release(addr, a));
/// assert!(tokens.allocate(addr, now).is_ok());
/// ```
pub struct TokenAllocator<C: Clock> {
  limit: usize,
  idle: Millis,
  endpoints: Stem<BTreeMap<SocketAddr, Endpoint<C>>>,
}

impl<C: Clock> core::fmt::Debug for TokenAllocator<C> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("TokenAllocator")
     .field("limit", &self.limit)
     .field("idle", &self.idle)
     .field("endpoints", &self.endpoints)
     .finish()
  }
}

fn encode(n: u64) -> Token {
  let skip = (n.leading_zeros() / 8) as usize;
  Token(n.to_be_bytes().into_iter().skip(skip).collect())
}

impl<C: Clock> TokenAllocator<C> {
  /// Create an allocator allowing `limit` tokens
  /// to be owned per endpoint, remembering endpoints
  /// that own none for `idle`
  pub fn new(limit: usize, idle: Millis) -> Self {
    Self { limit,
           idle,
           endpoints: Stem::new(BTreeMap::new()) }
  }

  /// Issue a token for an exchange with `addr`
  pub fn allocate(&self, addr: SocketAddr, now: Instant<C>) -> Result<Token, NoTokenAvailable> {
    let (limit, idle) = (self.limit, self.idle);

    self.endpoints.map_mut(|endpoints| {
                    endpoints.retain(|a, ep| {
                               *a == addr
                               || !ep.in_use.is_empty()
                               || millis_since(ep.last_used, now) < idle
                             });

                    let ep = endpoints.entry(addr).or_insert_with(|| Endpoint { next: 0,
                                                                                in_use: BTreeSet::new(),
                                                                                last_used: now });
                    ep.last_used = now;

                    if ep.in_use.len() >= limit {
                      return Err(NoTokenAvailable { addr,
                                                    in_use: ep.in_use.len() });
                    }

                    loop {
                      ep.next = ep.next.wrapping_add(1).max(1);
                      let token = encode(ep.next);

                      if ep.in_use.insert(token.0) {
                        log::trace!("{:?} issued to {}", token, addr);
                        break Ok(token);
                      }
                    }
                  })
  }

  /// Surrender a token, allowing it to be issued again.
  ///
  /// Returns `false` (and logs a warning) when the token
  /// was not owned.
  pub fn release(&self, addr: SocketAddr, token: Token) -> bool {
    let released = self.endpoints.map_mut(|endpoints| {
                                   endpoints.get_mut(&addr)
                                            .map(|ep| ep.in_use.remove(&token.0))
                                            .unwrap_or(false)
                                 });

    if !released {
      log::warn!("{:?} released for {}, but it was not issued", token, addr);
    }

    released
  }

  /// Number of tokens `addr` currently owns
  pub fn in_use(&self, addr: SocketAddr) -> usize {
    self.endpoints
        .map_ref(|endpoints| endpoints.get(&addr).map(|ep| ep.in_use.len()).unwrap_or(0))
  }

  /// Is `token` currently owned by an exchange with `addr`?
  pub fn is_owned(&self, addr: SocketAddr, token: Token) -> bool {
    self.endpoints.map_ref(|endpoints| {
                    endpoints.get(&addr)
                             .map(|ep| ep.in_use.contains(&token.0))
                             .unwrap_or(false)
                  })
  }

  /// Number of endpoints remembered
  pub fn endpoints(&self) -> usize {
    self.endpoints.map_ref(|endpoints| endpoints.len())
  }

  /// Surrender every token owned by every endpoint
  pub fn release_all(&self) -> usize {
    self.endpoints.map_mut(|endpoints| {
                    let n = endpoints.values().map(|ep| ep.in_use.len()).sum();
                    endpoints.values_mut().for_each(|ep| ep.in_use.clear());
                    n
                  })
  }
}
