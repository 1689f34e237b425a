//! Reliable transmission of confirmable messages.
//!
//! Every CON message we send is _tracked_ until one of
//! these things happens:
//!  - it is acknowledged (ACK, or a piggybacked response)
//!  - it is rejected with RST
//!  - it is cancelled by its owner
//!  - we give up on it after retransmitting it too many times
//!
//! ```text
//! Scheduled -> (Retransmitted)* -> Acknowledged | Reset | Cancelled | TimedOut
//! ```
//!
//! Every way out of the tracked state releases the message id.
//!
//! The tracking table is never locked while the transport or the
//! scheduler runs, so a transport may call back into the exchange
//! layer (e.g. to deliver an ACK) and a panicking transport leaves
//! the table usable.
//!
//! Each tracked message carries a small state machine instead:
//!
//! ```text
//! Idle --(timer fires)--> Sending --(sent)--> Idle
//!   \                        \
//!    `------(ack, rst, cancel, give up)-------> Done
//! ```
//!
//! A retransmission must move `Idle -> Sending` before touching the wire,
//! so once a message is `Done` it is never sent again. A message that
//! becomes `Done` while it is being sent is not rescheduled and
//! produces no [`Event::Retransmitted`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use toad_msg::{Id, Token};
use toad_stem::Stem;

use crate::id::IdAllocator;
use crate::msg::Message;
use crate::net::{self, Addrd, TokenBytes, Transport};
use crate::retry::{Attempts, RetryTimer, YouShould};
use crate::schedule::{Cancel, Schedule};
use crate::time::{Clock, Millis};

/// Something interesting happened to a tracked message
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
  /// The message was sent again
  Retransmitted {
    /// Message id and destination
    id: Addrd<Id>,
    /// The message's token
    token: Token,
    /// Which retransmission this was, starting at 1
    attempt: Attempts,
  },
  /// We gave up waiting for an ACK
  TimedOut {
    /// Message id and destination
    id: Addrd<Id>,
    /// The message's token
    token: Token,
  },
}

/// Receives [`Event`]s from a [`Retransmitter`].
///
/// Invoked from timer jobs, never while any table is locked.
pub trait Listener: Send + Sync {
  /// An event occurred
  fn on_event(&self, event: Event);
}

const IDLE: u8 = 0;
const SENDING: u8 = 1;
const DONE: u8 = 2;

struct Context<H> {
  msg: Addrd<Message>,
  timer: RetryTimer,
  handle: Option<H>,
  generation: u64,
  state: Arc<AtomicU8>,
}

impl<H> core::fmt::Debug for Context<H> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Context")
     .field("msg", &self.msg)
     .field("timer", &self.timer)
     .field("generation", &self.generation)
     .field("state", &self.state.load(Ordering::Relaxed))
     .finish()
  }
}

impl<H: Cancel> Context<H> {
  fn token_key(&self) -> Addrd<TokenBytes> {
    Addrd(self.msg.data().token, self.msg.addr()).key()
  }

  fn stop(&self) {
    self.state.store(DONE, Ordering::Release);
    if let Some(h) = self.handle.as_ref() {
      h.cancel();
    }
  }
}

/// Tracked messages, plus an index from the tokens
/// of tracked requests to their message ids
struct Table<H> {
  contexts: BTreeMap<Addrd<Id>, Context<H>>,
  by_token: BTreeMap<Addrd<TokenBytes>, Addrd<Id>>,
}

impl<H> Default for Table<H> {
  fn default() -> Self {
    Self { contexts: BTreeMap::new(),
           by_token: BTreeMap::new() }
  }
}

impl<H> core::fmt::Debug for Table<H> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_map().entries(self.contexts.iter()).finish()
  }
}

impl<H: Cancel> Table<H> {
  fn insert(&mut self, key: Addrd<Id>, ctx: Context<H>) -> Option<Context<H>> {
    let displaced = self.remove(&key);

    if ctx.msg.data().is_request() {
      self.by_token.insert(ctx.token_key(), key);
    }

    self.contexts.insert(key, ctx);
    displaced
  }

  /// Stop tracking `key`. The removed context is marked done.
  fn remove(&mut self, key: &Addrd<Id>) -> Option<Context<H>> {
    let ctx = self.contexts.remove(key)?;
    let tk = ctx.token_key();

    if self.by_token.get(&tk) == Some(key) {
      self.by_token.remove(&tk);
    }

    ctx.state.store(DONE, Ordering::Release);
    Some(ctx)
  }

  fn drain(&mut self) -> BTreeMap<Addrd<Id>, Context<H>> {
    self.by_token.clear();
    let drained = core::mem::take(&mut self.contexts);
    drained.values()
           .for_each(|ctx| ctx.state.store(DONE, Ordering::Release));
    drained
  }
}

enum Fired {
  Nothing,
  Resend {
    msg: Addrd<Message>,
    state: Arc<AtomicU8>,
    wait: Millis,
    event: Event,
  },
  Exhausted(Event),
}

struct Shared<T: Transport, S: Schedule, C: Clock> {
  table: Stem<Table<S::Handle>>,
  generation: AtomicU64,
  ids: Arc<IdAllocator<C>>,
  transport: Arc<T>,
  scheduler: S,
  listener: Weak<dyn Listener>,
}

/// Tracks outbound CON messages and retransmits them until
/// they are acknowledged or we give up.
///
/// See the [module documentation](crate::retransmit).
pub struct Retransmitter<T: Transport, S: Schedule, C: Clock> {
  shared: Arc<Shared<T, S, C>>,
}

impl<T: Transport, S: Schedule, C: Clock> core::fmt::Debug for Retransmitter<T, S, C> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Retransmitter")
     .field("contexts", &self.shared.table)
     .finish()
  }
}

impl<T: Transport, S: Schedule, C: Clock> Shared<T, S, C> {
  fn job(weak: Weak<Self>, key: Addrd<Id>, generation: u64) -> impl FnOnce() + Send + 'static {
    move || {
      if let Some(shared) = weak.upgrade() {
        shared.fire(key, generation)
      }
    }
  }

  /// Store a freshly scheduled timer on the context it belongs to,
  /// cancelling the timer if the context has since gone away.
  fn arm(&self, key: Addrd<Id>, generation: u64, handle: S::Handle, replace: bool) {
    let mut handle = Some(handle);

    self.table.map_mut(|t| match t.contexts.get_mut(&key) {
                | Some(ctx) if ctx.generation == generation && (replace || ctx.handle.is_none()) => {
                  ctx.handle = handle.take();
                },
                | _ => (),
              });

    if let Some(h) = handle {
      h.cancel();
    }
  }

  fn fire(self: &Arc<Self>, key: Addrd<Id>, generation: u64) {
    let fired = self.table.map_mut(|t| {
                            let ctx = match t.contexts.get_mut(&key) {
                              | Some(ctx) if ctx.generation == generation => ctx,
                              | _ => return Fired::Nothing,
                            };

                            match ctx.timer.what_should_i_do() {
                              | YouShould::Retry { wait } => {
                                let event = Event::Retransmitted { id: key,
                                                                   token: ctx.msg.data().token,
                                                                   attempt: ctx.timer.attempts() };
                                Fired::Resend { msg: ctx.msg.clone(),
                                                state: ctx.state.clone(),
                                                wait,
                                                event }
                              },
                              | YouShould::Cry => match t.remove(&key) {
                                | Some(ctx) => Fired::Exhausted(Event::TimedOut { id: key,
                                                                                  token: ctx.msg.data().token }),
                                | None => Fired::Nothing,
                              },
                            }
                          });

    match fired {
      | Fired::Nothing => (),
      | Fired::Resend { msg,
                        state,
                        wait,
                        event, } => {
        if state.compare_exchange(IDLE, SENDING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
          return;
        }

        match net::send_contained(&*self.transport, msg) {
          | Some(Ok(())) => (),
          | Some(Err(e)) => log::warn!("retransmission of {:?} to {} failed: {:?}",
                                       key.data(),
                                       key.addr(),
                                       e),
          | None => log::error!("transport panicked while retransmitting {:?} to {}",
                                key.data(),
                                key.addr()),
        }

        if state.compare_exchange(SENDING, IDLE, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
          log::trace!("{:?} to {} finished while being retransmitted",
                      key.data(),
                      key.addr());
          return;
        }

        let handle = self.scheduler
                         .schedule(wait, Self::job(Arc::downgrade(self), key, generation));
        self.arm(key, generation, handle, true);

        log::trace!("retransmitted {:?}", event);
        self.notify(event);
      },
      | Fired::Exhausted(event) => {
        log::debug!("gave up on {:?}", event);
        self.ids.release(key.addr(), *key.data());
        self.notify(event);
      },
    }
  }

  fn notify(&self, event: Event) {
    match self.listener.upgrade() {
      | Some(l) => l.on_event(event),
      | None => log::trace!("{:?} with nobody listening", event),
    }
  }

  fn finished(&self, key: Addrd<Id>, ctx: Context<S::Handle>, how: &str) -> Token {
    ctx.stop();

    log::trace!("{:?} to {} {} after {} retransmissions",
                key.data(),
                key.addr(),
                how,
                ctx.timer.attempts().0);

    self.ids.release(key.addr(), *key.data());
    ctx.msg.data().token
  }

  fn finish(&self, key: Addrd<Id>, how: &str) -> Option<Token> {
    let ctx = self.table.map_mut(|t| t.remove(&key))?;
    Some(self.finished(key, ctx, how))
  }
}

impl<T: Transport, S: Schedule, C: Clock> Retransmitter<T, S, C> {
  /// Create a retransmitter.
  ///
  /// Message ids of messages that stop being tracked
  /// are released to `ids`.
  pub fn new(transport: Arc<T>,
             scheduler: S,
             ids: Arc<IdAllocator<C>>,
             listener: Weak<dyn Listener>)
             -> Self {
    Self { shared: Arc::new(Shared { table: Stem::new(Table::default()),
                                     generation: AtomicU64::new(0),
                                     ids,
                                     transport,
                                     scheduler,
                                     listener }) }
  }

  /// Start tracking a message that is about to be sent for the first time.
  ///
  /// `timer` decides when to retransmit it and when to give up.
  pub fn track(&self, msg: Addrd<Message>, timer: RetryTimer) {
    let key = Addrd(msg.data().id, msg.addr());
    let generation = self.shared.generation.fetch_add(1, Ordering::Relaxed);
    let first_delay = timer.first_delay();

    let mut ctx = Some(Context { msg,
                                 timer,
                                 handle: None,
                                 generation,
                                 state: Arc::new(AtomicU8::new(IDLE)) });
    let displaced = self.shared
                        .table
                        .map_mut(|t| ctx.take().and_then(|ctx| t.insert(key, ctx)));

    if let Some(old) = displaced {
      log::error!("{:?} to {} was already being retransmitted; replacing it",
                  key.data(),
                  key.addr());
      old.stop();
    }

    let job = Shared::job(Arc::downgrade(&self.shared), key, generation);
    let handle = self.shared.scheduler.schedule(first_delay, job);
    self.shared.arm(key, generation, handle, false);

    log::trace!("tracking {:?} to {}, first retransmission in {:?}",
                key.data(),
                key.addr(),
                first_delay);
  }

  /// The message with id `id` was acknowledged
  ///
  /// Returns the token of the message that was being
  /// tracked, or `None` if it was not being tracked.
  pub fn acknowledge(&self, id: Addrd<Id>) -> Option<Token> {
    self.shared.finish(id, "acknowledged")
  }

  /// The message with id `id` was rejected with RST
  ///
  /// Returns the token of the message that was being
  /// tracked, or `None` if it was not being tracked.
  pub fn reset(&self, id: Addrd<Id>) -> Option<Token> {
    self.shared.finish(id, "reset")
  }

  /// Stop retransmitting the message with id `id`
  pub fn cancel(&self, id: Addrd<Id>) -> Option<Token> {
    self.shared.finish(id, "cancelled")
  }

  /// A separate response arrived for the request with token `token`,
  /// which implies the request was received.
  ///
  /// Returns the id of the request that was being tracked.
  pub fn acknowledge_token(&self, token: Addrd<Token>) -> Option<Id> {
    let tk = token.key();
    let (key, ctx) = self.shared.table.map_mut(|t| {
                                        let key = t.by_token.get(&tk).copied()?;
                                        t.remove(&key).map(|ctx| (key, ctx))
                                      })?;

    self.shared
        .finished(key, ctx, "acknowledged by a separate response");
    Some(*key.data())
  }

  /// Stop retransmitting everything, yielding the
  /// ids & tokens of the messages that were tracked
  pub fn cancel_all(&self) -> Vec<Addrd<Token>> {
    let drained = self.shared.table.map_mut(|t| t.drain());

    drained.into_iter()
           .map(|(key, ctx)| {
             ctx.stop();
             self.shared.ids.release(key.addr(), *key.data());
             Addrd(ctx.msg.data().token, key.addr())
           })
           .collect()
  }

  /// Number of messages being tracked
  pub fn len(&self) -> usize {
    self.shared.table.map_ref(|t| t.contexts.len())
  }

  /// Is nothing being tracked?
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Is the message with id `id` being tracked?
  pub fn is_tracking(&self, id: Addrd<Id>) -> bool {
    self.shared.table.map_ref(|t| t.contexts.contains_key(&id))
  }
}
