use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use embedded_time::duration::Milliseconds;
use embedded_time::Instant;
use toad_msg::{Code, Id, Token, Type};
use toad_stem::Stem;

mod error;
#[doc(inline)]
pub use error::*;

use crate::callback::{Callback, Transmission};
use crate::config::Config;
use crate::dedupe::{Check, Seen};
use crate::dispatch::{Dispatch, Notified};
use crate::id::IdAllocator;
use crate::logging::msg_summary;
use crate::msg::{Kind, Message};
use crate::net::{self, Addrd, Transport};
use crate::retransmit::{Event, Listener, Retransmitter};
use crate::retry::{Attempts, RetryTimer};
use crate::schedule::Schedule;
use crate::stats::{Anomaly, Stats};
use crate::subscribe::{Due, Subscribers};
use crate::time::{millis_since_epoch, Clock};
use crate::token::TokenAllocator;

/// Handles inbound requests.
///
/// Invoked on the [`Schedule`]r's worker pool.
/// Returning `Some` sends the response piggybacked on the ACK
/// (for CON requests) or as a NON (for NON requests); the response's
/// type, id and token are filled in for you.
///
/// Returning `None` to a CON request sends an empty ACK.
///
/// A successful response to a GET carrying an observe option of `0`
/// subscribes the requester to the request's path; see [`Core::notify`].
pub trait RequestHandler: Send + Sync + 'static {
  /// Handle a request
  fn handle(&self, req: Addrd<&Message>) -> Option<Message>;
}

impl<F> RequestHandler for F where F: for<'a> Fn(Addrd<&'a Message>) -> Option<Message> + Send + Sync + 'static
{
  fn handle(&self, req: Addrd<&Message>) -> Option<Message> {
    self(req)
  }
}

/// How an inbound message will be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
  /// ACK with code 0.00
  EmptyAck,
  /// RST
  Reset,
  /// Response; piggybacked on an ACK, or separate (CON / NON)
  Response,
  /// CON or NON request
  Request,
  /// CON with code 0.00
  Ping,
  /// Anything else
  Unclassifiable,
}

impl Inbound {
  /// Classify a message
  pub fn classify(msg: &Message) -> Self {
    match (msg.ty, msg.kind()) {
      | (Type::Ack, Kind::Empty) => Inbound::EmptyAck,
      | (Type::Reset, Kind::Empty) => Inbound::Reset,
      | (Type::Con, Kind::Empty) => Inbound::Ping,
      | (Type::Ack | Type::Con | Type::Non, Kind::Response) => Inbound::Response,
      | (Type::Con | Type::Non, Kind::Request) => Inbound::Request,
      | _ => Inbound::Unclassifiable,
    }
  }
}

struct Shared<T: Transport, S: Schedule, C: Clock> {
  config: Config,
  clock: C,
  transport: Arc<T>,
  scheduler: S,
  tokens: TokenAllocator<C>,
  ids: Arc<IdAllocator<C>>,
  retransmitter: Retransmitter<T, S, C>,
  dispatch: Dispatch<C>,
  subscribers: Subscribers,
  seen: Seen<C>,
  handler: Stem<Option<Arc<dyn RequestHandler>>>,
  stats: Stats,
  shut_down: AtomicBool,
  sent: AtomicU64,
}

/// The exchange layer.
///
/// Sends requests reliably and routes inbound messages
/// to whoever is waiting for them.
///
/// `Core` is cheap to clone; clones share all state.
///
/// ```
/// use std::sync::Arc;
///
/// use toad_exchange::callback::Callback;
/// use toad_exchange::config::Config;
/// use toad_exchange::core::Core;
/// use toad_exchange::msg::Message;
/// use toad_exchange::net::Addrd;
/// use toad_exchange::runtime::{Clock, Scheduler};
/// use toad_msg::{Code, Id, Token, Type};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let (tx, mut wire) = tokio::sync::mpsc::unbounded_channel::<Addrd<Message>>();
/// let core = Core::new(Config::default(), Clock::new(), tx, Scheduler::current(16).unwrap());
///
/// let server = "127.0.0.1:5683".parse().unwrap();
/// let get = Message::new(Type::Con, Code::new(0, 1), Id(0), Token(Default::default()));
///
/// let (token, id) = core.send(Addrd(get, server),
///                             Callback::new(|rep| println!("got {:?}", rep.data().code)))
///                       .unwrap();
///
/// let sent = wire.recv().await.unwrap();
/// assert_eq!(sent.data().token, token);
///
/// let rep = Message::new(Type::Ack, Code::new(2, 5), id, token);
/// core.receive(Addrd(rep, server));
///
/// assert!(core.dispatch().is_empty());
/// # }
/// ```
pub struct Core<T: Transport, S: Schedule, C: Clock> {
  shared: Arc<Shared<T, S, C>>,
}

impl<T: Transport, S: Schedule, C: Clock> Clone for Core<T, S, C> {
  fn clone(&self) -> Self {
    Self { shared: self.shared.clone() }
  }
}

impl<T: Transport, S: Schedule, C: Clock> core::fmt::Debug for Core<T, S, C> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Core")
     .field("config", &self.shared.config)
     .field("tokens", &self.shared.tokens)
     .field("ids", &self.shared.ids)
     .field("retransmitter", &self.shared.retransmitter)
     .field("dispatch", &self.shared.dispatch)
     .field("subscribers", &self.shared.subscribers)
     .field("stats", &self.shared.stats)
     .finish()
  }
}

impl<T: Transport, S: Schedule, C: Clock> Core<T, S, C> {
  /// Create a new exchange layer
  pub fn new(config: Config, clock: C, transport: T, scheduler: S) -> Self {
    let transport = Arc::new(transport);
    let lifetime = Milliseconds(config.exchange_lifetime_millis());
    let ids = Arc::new(IdAllocator::new(config.msg.message_id_limit,
                                        config.msg.id_seed,
                                        Milliseconds(config.max_transmit_wait_millis()),
                                        lifetime));

    let shared = Arc::new_cyclic(|me: &Weak<Shared<T, S, C>>| {
                   let listener: Weak<dyn Listener> = me.clone();

                   Shared { retransmitter: Retransmitter::new(transport.clone(),
                                                              scheduler.clone(),
                                                              ids.clone(),
                                                              listener),
                            tokens: TokenAllocator::new(config.msg.token_limit, lifetime),
                            dispatch: Dispatch::new(),
                            subscribers: Subscribers::new(),
                            seen: Seen::new(lifetime),
                            handler: Stem::new(None),
                            stats: Stats::default(),
                            shut_down: AtomicBool::new(false),
                            sent: AtomicU64::new(0),
                            ids,
                            transport,
                            scheduler,
                            clock,
                            config }
                 });

    Self { shared }
  }

  /// Send a request.
  ///
  /// A token and message id are issued for the request (any already
  /// set are overwritten), and `callback` is registered to receive
  /// whatever happens to it. CON requests are retransmitted until
  /// they're acknowledged.
  ///
  /// A request carrying an observe option of `0` starts an observation;
  /// its callback stays registered (and receives every fresh notification)
  /// until an error or non-notification response arrives, or
  /// [`Core::cancel_observation`] is invoked.
  ///
  /// If no token or message id is available, the callback's
  /// corresponding handler is invoked as well as returning `Err`.
  pub fn send(&self,
              req: Addrd<Message>,
              callback: Callback)
              -> Result<(Token, Id), Error<T::Error>> {
    self.shared.send(req, callback)
  }

  /// Handle a message received from the transport
  pub fn receive(&self, msg: Addrd<Message>) {
    self.shared.receive(msg)
  }

  /// The resource at `path` changed; send `notification` to
  /// everyone observing it.
  ///
  /// Token, message id and observe sequence number are filled in per
  /// subscriber. A CON `notification` is retransmitted until it is
  /// acknowledged, replacing any earlier CON notification to the same
  /// subscriber still waiting for an ACK; any other type is sent as NON.
  ///
  /// Subscribers that reject a notification with RST, or never
  /// acknowledge a CON notification, are unsubscribed.
  ///
  /// Returns the number of notifications sent.
  pub fn notify(&self, path: &str, notification: Message) -> usize {
    self.shared.notify(path, notification)
  }

  /// Start handling inbound requests with `handler`
  pub fn set_request_handler(&self, handler: impl RequestHandler) {
    let mut handler = Some(Arc::new(handler) as Arc<dyn RequestHandler>);
    self.shared.handler.map_mut(|h| {
                          if let Some(new) = handler.take() {
                            *h = Some(new);
                          }
                        });
  }

  /// Stop handling inbound requests; CON requests
  /// will be rejected with RST
  pub fn clear_request_handler(&self) {
    self.shared.handler.map_mut(|h| *h = None);
  }

  /// Stop waiting for notifications on an observation
  /// (or a response to any other request), releasing its token.
  ///
  /// Notifications that arrive afterwards are rejected with RST.
  ///
  /// Returns `false` if nothing was waiting on `token`.
  pub fn cancel_observation(&self, token: Addrd<Token>) -> bool {
    match self.shared.dispatch.remove(token) {
      | Some(_) => {
        self.shared.retransmitter.acknowledge_token(token);
        self.shared.release_token(token);
        log::debug!("no longer waiting on {:?} from {}", token.data(), token.addr());
        true
      },
      | None => false,
    }
  }

  /// Stop everything.
  ///
  /// Pending retransmissions are cancelled, every token & message
  /// id is released and sending new requests fails with
  /// [`What::ShutDown`]. Inbound messages are ignored.
  pub fn shutdown(&self) {
    let s = &self.shared;

    if s.shut_down.swap(true, Ordering::SeqCst) {
      return;
    }

    let retransmissions = s.retransmitter.cancel_all().len();
    let exchanges = s.dispatch.drain().len();
    let subscribers = s.subscribers.clear();
    s.tokens.release_all();
    s.ids.release_all();
    s.seen.clear();
    s.handler.map_mut(|h| *h = None);

    log::info!("shut down; abandoned {} exchanges, {} pending retransmissions and {} subscribers",
               exchanges,
               retransmissions,
               subscribers);
  }

  /// Has [`Core::shutdown`] been invoked?
  pub fn is_shut_down(&self) -> bool {
    self.shared.shut_down.load(Ordering::SeqCst)
  }

  /// Anomaly counters
  pub fn stats(&self) -> &Stats {
    &self.shared.stats
  }

  /// The config in use
  pub fn config(&self) -> &Config {
    &self.shared.config
  }

  /// The clock in use
  pub fn clock(&self) -> &C {
    &self.shared.clock
  }

  /// Token allocator
  pub fn tokens(&self) -> &TokenAllocator<C> {
    &self.shared.tokens
  }

  /// Message id allocator
  pub fn ids(&self) -> &IdAllocator<C> {
    &self.shared.ids
  }

  /// Response dispatch table
  pub fn dispatch(&self) -> &Dispatch<C> {
    &self.shared.dispatch
  }

  /// Retransmission engine
  pub fn retransmitter(&self) -> &Retransmitter<T, S, C> {
    &self.shared.retransmitter
  }

  /// Observers of our resources
  pub fn subscribers(&self) -> &Subscribers {
    &self.shared.subscribers
  }
}

impl<T: Transport, S: Schedule, C: Clock> Shared<T, S, C> {
  fn now(&self) -> Result<Instant<C>, embedded_time::clock::Error> {
    self.clock.try_now()
  }

  fn is_shut_down(&self) -> bool {
    self.shut_down.load(Ordering::SeqCst)
  }

  fn transmit(&self, msg: Addrd<Message>) -> Result<(), What<T::Error>> {
    match net::send_contained(&*self.transport, msg) {
      | Some(r) => r.map_err(What::from),
      | None => {
        log::error!("transport panicked");
        Err(What::TransportPanicked)
      },
    }
  }

  fn invoke<R>(&self, what: &str, f: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
      | Ok(r) => Some(r),
      | Err(_) => {
        log::error!("{} handler panicked", what);
        self.stats.record(Anomaly::CallbackPanicked);
        None
      },
    }
  }

  fn release_token(&self, token: Addrd<Token>) {
    if !self.tokens.release(token.addr(), *token.data()) {
      self.stats.record(Anomaly::TokenNotReturned);
    }
  }

  fn release_id(&self, id: Addrd<Id>) {
    if !self.ids.release(id.addr(), *id.data()) {
      self.stats.record(Anomaly::MessageIdNotReturned);
    }
  }

  fn retry_timer(&self, now: Instant<C>) -> RetryTimer {
    let con = self.config.msg.con;
    let seed = self.config.msg.id_seed
               ^ millis_since_epoch(now)
               ^ self.sent.fetch_add(1, Ordering::Relaxed).rotate_left(32);

    RetryTimer::new(con.retry_strategy, con.max_attempts, con.backoff_ceiling, seed)
  }

  fn send(&self, req: Addrd<Message>, callback: Callback) -> Result<(Token, Id), Error<T::Error>> {
    let addr = req.addr();
    let when = When::SendingRequest(addr);

    if self.is_shut_down() {
      return Err(when.what(What::ShutDown));
    }

    let now = self.now().map_err(|_| when.what(What::ClockError))?;
    let callback = Arc::new(callback);

    let token = match self.tokens.allocate(addr, now) {
      | Ok(t) => t,
      | Err(e) => {
        log::warn!("{} owns {} tokens, refusing to send another request",
                   addr,
                   e.in_use);
        self.invoke("no token", || callback.no_token(addr));
        return Err(when.what(e.into()));
      },
    };

    let id = match self.ids.allocate(addr, now) {
      | Ok(id) => id,
      | Err(e) => {
        log::warn!("no message ids available for {}; try again in {:?}",
                   addr,
                   e.retry_after);
        self.release_token(Addrd(token, addr));
        self.invoke("no message id", || callback.no_message_id(addr, e.retry_after));
        return Err(when.what(e.into()));
      },
    };

    let mut msg = req.unwrap();
    msg.token = token;
    msg.id = id;

    let key = Addrd(token, addr);
    let observe = msg.observe == Some(0);
    let con = msg.is_con();

    if self.dispatch
           .register(key, callback.clone(), now, observe)
           .is_some()
    {
      self.stats.record(Anomaly::DuplicateRegistration);
    }

    let msg = Addrd(msg, addr);

    if con {
      self.retransmitter.track(msg.clone(), self.retry_timer(now));
    }

    // `shutdown` raises the flag before it clears the tables, so an
    // exchange registered after that clearing is seen here
    if self.is_shut_down() {
      log::debug!("shut down while sending {:?} to {}; abandoning it", id, addr);
      self.retransmitter.cancel(Addrd(id, addr));
      self.dispatch.remove(key);
      if self.tokens.is_owned(addr, token) {
        self.tokens.release(addr, token);
      }
      if self.ids.is_in_flight(addr, id) {
        self.ids.release(addr, id);
      }
      return Err(when.what(What::ShutDown));
    }

    log::trace!("sending {} to {}", msg_summary(msg.data()), addr);

    if let Err(what) = self.transmit(msg) {
      log::warn!("failed to send {:?} to {}: {:?}", id, addr, what);
      self.stats.record(Anomaly::TransportFailed);

      if !con || self.retransmitter.cancel(Addrd(id, addr)).is_none() {
        self.release_id(Addrd(id, addr));
      }
      self.dispatch.remove(key);
      self.release_token(key);

      return Err(when.what(what));
    }

    if !con {
      self.release_id(Addrd(id, addr));
    }

    self.invoke("transmission", || {
          callback.transmission(Transmission { addr,
                                               token,
                                               id,
                                               attempt: Attempts(0) })
        });

    Ok((token, id))
  }

  fn send_reply(&self, reply: Addrd<Message>) {
    let addr = reply.addr();
    log::trace!("replying to {} with {}", addr, msg_summary(reply.data()));

    if let Err(what) = self.transmit(reply) {
      log::warn!("{:?}", When::Replying(addr).what(what));
      self.stats.record(Anomaly::TransportFailed);
    }
  }

  /// Reply to the message with id `id`, remembering
  /// the reply in case the message is retransmitted
  fn reply(&self, id: Addrd<Id>, reply: Message) {
    self.seen.replied(id, reply.clone());
    self.send_reply(Addrd(reply, id.addr()));
  }

  fn receive(self: &Arc<Self>, msg: Addrd<Message>) {
    if self.shut_down.load(Ordering::SeqCst) {
      log::debug!("shut down; ignoring {}", msg_summary(msg.data()));
      return;
    }

    let now = match self.now() {
      | Ok(now) => now,
      | Err(e) => {
        log::error!("clock failed: {:?}; dropping {}", e, msg_summary(msg.data()));
        return;
      },
    };

    log::trace!("received {} from {}", msg_summary(msg.data()), msg.addr());

    match Inbound::classify(msg.data()) {
      | Inbound::EmptyAck => self.on_empty_ack(msg),
      | Inbound::Reset => self.on_reset(msg),
      | Inbound::Response => self.on_response(msg, now),
      | Inbound::Request => self.on_request(msg, now),
      | Inbound::Ping => {
        log::debug!("pinged by {}", msg.addr());
        self.send_reply(Addrd(Message::reset(msg.data().id), msg.addr()));
      },
      | Inbound::Unclassifiable => {
        log::error!("don't know what to do with {} from {}",
                    msg_summary(msg.data()),
                    msg.addr());
        self.stats.record(Anomaly::UnclassifiableMessage);
      },
    }
  }

  fn on_empty_ack(&self, msg: Addrd<Message>) {
    let id = Addrd(msg.data().id, msg.addr());
    let tracked = self.retransmitter.acknowledge(id);

    if self.subscribers.acknowledged(id) {
      log::trace!("{} acknowledged notification {:?}", id.addr(), id.data());
      return;
    }

    let token = match tracked {
      | Some(token) => token,
      | None => {
        log::warn!("empty ACK for {:?} from {}, which we are not waiting on",
                   id.data(),
                   id.addr());
        self.stats.record(Anomaly::MissingDispatchEntry);
        return;
      },
    };

    match self.dispatch.lookup(Addrd(token, id.addr())) {
      | Some(cb) => {
        if self.invoke("empty ACK", || cb.empty_ack(id)) == Some(false) {
          log::trace!("{:?} acknowledged; waiting for separate response", token);
        }
      },
      | None => {
        log::warn!("no callback found for empty ACK for {:?} from {}",
                   token,
                   id.addr());
        self.stats.record(Anomaly::MissingDispatchEntry);
      },
    }
  }

  fn on_reset(&self, msg: Addrd<Message>) {
    let id = Addrd(msg.data().id, msg.addr());
    let tracked = self.retransmitter.reset(id);

    if let Some(sub) = self.subscribers.remove_notified(id) {
      log::debug!("{} rejected notification {:?}; unsubscribed {:?}",
                  id.addr(),
                  id.data(),
                  sub.data());
      return;
    }

    let token = match tracked {
      | Some(token) => Addrd(token, id.addr()),
      | None => {
        log::error!("RST for {:?} from {}, which we are not waiting on",
                    id.data(),
                    id.addr());
        self.stats.record(Anomaly::MissingDispatchEntry);
        return;
      },
    };

    match self.dispatch.remove(token) {
      | Some(cb) => {
        self.release_token(token);
        if self.invoke("RST", || cb.reset(id)) == Some(false) {
          log::debug!("{:?} was rejected by {}", token.data(), token.addr());
        }
      },
      | None => {
        log::error!("no callback found for RST for {:?} from {}",
                    token.data(),
                    token.addr());
        self.stats.record(Anomaly::MissingDispatchEntry);
      },
    }
  }

  fn on_response(&self, msg: Addrd<Message>, now: Instant<C>) {
    let addr = msg.addr();
    let (ty, id, token) = (msg.data().ty, Addrd(msg.data().id, addr), Addrd(msg.data().token, addr));

    if ty == Type::Ack {
      self.retransmitter.acknowledge(id);
    } else {
      match self.seen.check(id, now) {
        | Check::New => (),
        | Check::Duplicate(reply) => {
          log::debug!("{:?} from {} is a duplicate", id.data(), addr);
          self.stats.record(Anomaly::Duplicate);
          reply.into_iter()
               .for_each(|r| self.send_reply(Addrd(r, addr)));
          return;
        },
      }

      self.retransmitter.acknowledge_token(token);
    }

    let cb = match (msg.data().is_notification(), msg.data().observe) {
      | (true, Some(seq)) => match self.dispatch.notify(token, seq, now) {
        | Notified::Deliver(cb) => Some(cb),
        | Notified::Missing => None,
        | Notified::Stale { last } => {
          log::debug!("notification {} for {:?} from {} is older than {}; ignoring",
                      seq,
                      token.data(),
                      addr,
                      last);
          self.stats.record(Anomaly::StaleNotification);

          if ty == Type::Con {
            self.reply(id, Message::ack(*id.data()));
          }
          return;
        },
      },
      | _ => {
        let cb = self.dispatch.remove(token);
        if cb.is_some() {
          self.release_token(token);
        }
        cb
      },
    };

    match (ty, cb.is_some()) {
      | (Type::Con, true) => self.reply(id, Message::ack(*id.data())),
      | (Type::Con | Type::Non, false) => self.reply(id, Message::reset(*id.data())),
      | _ => (),
    }

    match cb {
      | Some(cb) => {
        self.invoke("response", || cb.response(msg.as_ref()));
      },
      | None => {
        log::error!("no callback found for {:?} from {} ({})",
                    token.data(),
                    addr,
                    msg_summary(msg.data()));
        self.stats.record(Anomaly::MissingDispatchEntry);
      },
    }
  }

  fn on_request(self: &Arc<Self>, msg: Addrd<Message>, now: Instant<C>) {
    let addr = msg.addr();
    let id = Addrd(msg.data().id, addr);

    if let Check::Duplicate(reply) = self.seen.check(id, now) {
      log::debug!("{:?} from {} is a duplicate", id.data(), addr);
      self.stats.record(Anomaly::Duplicate);
      reply.into_iter()
           .for_each(|r| self.send_reply(Addrd(r, addr)));
      return;
    }

    let handler = self.handler.map_ref(|h| h.clone());

    match handler {
      | None if msg.data().is_con() => {
        log::debug!("no request handler; rejecting {:?} from {}", id.data(), addr);
        self.reply(id, Message::reset(*id.data()));
      },
      | None => log::debug!("no request handler; dropping {:?} from {}", id.data(), addr),
      | Some(handler) => {
        let me = Arc::downgrade(self);
        self.scheduler.execute(move || {
                        if let Some(me) = me.upgrade() {
                          me.handle_request(handler.as_ref(), msg)
                        }
                      });
      },
    }
  }

  fn handle_request(&self, handler: &dyn RequestHandler, req: Addrd<Message>) {
    let addr = req.addr();
    let (ty, id, token) = (req.data().ty, req.data().id, req.data().token);
    let key = Addrd(token, addr);

    if self.is_shut_down() {
      log::debug!("shut down; not handling {:?} from {}", id, addr);
      return;
    }

    if req.data().observe == Some(1) && self.subscribers.unsubscribe(key) {
      log::debug!("{} stopped observing {:?}", addr, req.data().path);
    }

    let rep = self.invoke("request", || handler.handle(req.as_ref()))
                  .flatten()
                  .map(|mut rep| {
                    let registering =
                      req.data().observe == Some(0) && req.data().code == Code::new(0, 1);

                    if registering && rep.is_response() && !rep.is_error() {
                      rep.observe = Some(self.subscribers.subscribe(key, &req.data().path));
                    } else if registering {
                      rep.observe = None;
                    }
                    rep
                  });

    if self.is_shut_down() {
      self.subscribers.unsubscribe(key);
      log::debug!("shut down; not replying to {:?} from {}", id, addr);
      return;
    }

    match (ty, rep) {
      | (Type::Con, Some(mut rep)) => {
        rep.ty = Type::Ack;
        rep.id = id;
        rep.token = token;
        self.reply(Addrd(id, addr), rep);
      },
      | (Type::Con, None) => self.reply(Addrd(id, addr), Message::ack(id)),
      | (_, Some(mut rep)) => {
        let now = match self.now() {
          | Ok(now) => now,
          | Err(_) => {
            log::error!("clock failed; dropping response to {:?}", id);
            return;
          },
        };

        let rep_id = match self.ids.allocate(addr, now) {
          | Ok(id) => id,
          | Err(e) => {
            log::warn!("dropping response to {:?} from {}: {:?}", id, addr, e);
            return;
          },
        };

        rep.ty = Type::Non;
        rep.id = rep_id;
        rep.token = token;
        self.send_reply(Addrd(rep, addr));
        self.release_id(Addrd(rep_id, addr));
      },
      | (_, None) => (),
    }
  }

  fn notify(&self, path: &str, notification: Message) -> usize {
    if self.is_shut_down() {
      log::debug!("shut down; not notifying observers of {:?}", path);
      return 0;
    }

    let now = match self.now() {
      | Ok(now) => now,
      | Err(e) => {
        log::error!("clock failed: {:?}; not notifying observers of {:?}", e, path);
        return 0;
      },
    };

    let due = self.subscribers.due(path);
    log::trace!("{:?} changed; notifying {} observers", path, due.len());

    due.into_iter()
       .filter(|d| self.notify_one(d, &notification, now))
       .count()
  }

  fn notify_one(&self, due: &Due, notification: &Message, now: Instant<C>) -> bool {
    let addr = due.key.addr();

    if let Some(old) = due.superseded {
      if self.retransmitter.cancel(Addrd(old, addr)).is_some() {
        log::debug!("notification {:?} to {} superseded before it was acknowledged",
                    old,
                    addr);
      }
    }

    let id = match self.ids.allocate(addr, now) {
      | Ok(id) => id,
      | Err(e) => {
        log::warn!("not notifying {}: no message id available for {:?}",
                   addr,
                   e.retry_after);
        return false;
      },
    };

    let con = notification.is_con();
    let mut msg = notification.clone();
    if !con {
      msg.ty = Type::Non;
    }
    msg.id = id;
    msg.token = *due.key.data();
    msg.observe = Some(due.seq);

    self.subscribers.notified_with(due.key, id);
    let msg = Addrd(msg, addr);

    if con {
      self.retransmitter.track(msg.clone(), self.retry_timer(now));
    }

    log::trace!("notifying {} with {}", addr, msg_summary(msg.data()));

    if let Err(what) = self.transmit(msg) {
      log::warn!("failed to notify {}: {:?}", addr, what);
      self.stats.record(Anomaly::TransportFailed);

      if !con || self.retransmitter.cancel(Addrd(id, addr)).is_none() {
        self.release_id(Addrd(id, addr));
      }
      return false;
    }

    if !con {
      self.release_id(Addrd(id, addr));
    }

    true
  }
}

impl<T: Transport, S: Schedule, C: Clock> Listener for Shared<T, S, C> {
  fn on_event(&self, event: Event) {
    if self.is_shut_down() {
      log::trace!("shut down; ignoring {:?}", event);
      return;
    }

    match event {
      | Event::Retransmitted { id, .. } if self.subscribers.is_notification(id) => {
        log::trace!("retransmitted notification {:?} to {}", id.data(), id.addr())
      },
      | Event::TimedOut { id, .. } if self.subscribers.is_notification(id) => {
        if let Some(sub) = self.subscribers.remove_notified(id) {
          log::debug!("{} never acknowledged notification {:?}; unsubscribed {:?}",
                      id.addr(),
                      id.data(),
                      sub.data());
        }
      },
      | Event::Retransmitted { id, token, attempt } => {
        let key = Addrd(token, id.addr());
        match self.dispatch.lookup(key) {
          | Some(cb) => {
            self.invoke("transmission", || {
                  cb.transmission(Transmission { addr: id.addr(),
                                                 token,
                                                 id: *id.data(),
                                                 attempt })
                });
          },
          | None => log::debug!("retransmitted {:?} to {}, but nobody is waiting for it",
                                id.data(),
                                id.addr()),
        }
      },
      | Event::TimedOut { id, token } => {
        let key = Addrd(token, id.addr());
        log::debug!("{:?} to {} was never acknowledged", id.data(), id.addr());

        match self.dispatch.remove(key) {
          | Some(cb) => {
            self.release_token(key);
            if self.invoke("timeout", || cb.timeout(key)) == Some(false) {
              log::warn!("{:?} to {} timed out", token, id.addr());
            }
          },
          | None => log::debug!("nobody is waiting on timed out {:?}", token),
        }
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::AtomicUsize;
  use std::sync::Mutex;
  use std::time::Duration;

  use embedded_time::rate::Fraction;
  use toad_msg::Code;
  use tokio::sync::oneshot;

  use super::*;
  use crate::msg::EMPTY;
  use crate::retry::Strategy;
  use crate::runtime::{self, Scheduler};
  use crate::test::{self, Broken, Wire};

  type TestCore = Core<Wire, Scheduler, runtime::Clock>;

  #[derive(Debug, Clone, PartialEq)]
  enum Happened {
    Response(Code, Option<u32>),
    EmptyAck,
    Reset,
    Timeout,
    Transmission(u16),
    NoToken,
    NoMessageId(u64),
  }

  #[derive(Debug, Clone, Default)]
  struct Log(Arc<Mutex<Vec<Happened>>>);

  impl Log {
    fn push(&self, h: Happened) {
      self.0.lock().unwrap().push(h)
    }

    fn happened(&self) -> Vec<Happened> {
      self.0.lock().unwrap().clone()
    }

    fn count(&self, f: impl Fn(&Happened) -> bool) -> usize {
      self.happened().iter().filter(|h| f(h)).count()
    }

    fn callback(&self) -> Callback {
      let (a, b, c, d, e, f, g) = (self.clone(),
                                   self.clone(),
                                   self.clone(),
                                   self.clone(),
                                   self.clone(),
                                   self.clone(),
                                   self.clone());

      Callback::new(move |rep| a.push(Happened::Response(rep.data().code, rep.data().observe)))
        .on_empty_ack(move |_| b.push(Happened::EmptyAck))
        .on_reset(move |_| c.push(Happened::Reset))
        .on_timeout(move |_| d.push(Happened::Timeout))
        .on_transmission(move |t| e.push(Happened::Transmission(t.attempt.0)))
        .on_no_token(move |_| f.push(Happened::NoToken))
        .on_no_message_id(move |_, after| g.push(Happened::NoMessageId(after.0)))
    }
  }

  fn config() -> Config {
    let mut config = Config::default();
    config.msg.con.retry_strategy = Strategy::Exponential { init_min: Milliseconds(2_000),
                                                            init_max: Milliseconds(2_000) };
    config
  }

  fn core_with(config: Config) -> (TestCore, Wire) {
    test::init_logging();
    let wire = Wire::new();
    let core = Core::new(config,
                         runtime::Clock::new(),
                         wire.clone(),
                         Scheduler::current(4).unwrap());
    (core, wire)
  }

  fn reply(ty: Type, code: Code, id: Id, token: Token) -> Addrd<Message> {
    Addrd(Message::new(ty, code, id, token), test::dummy_addr())
  }

  fn settled<T: Transport>(core: &Core<T, Scheduler, runtime::Clock>) -> bool {
    core.dispatch().is_empty()
    && core.retransmitter().is_empty()
    && core.tokens().in_use(test::dummy_addr()) == 0
    && core.ids().in_flight(test::dummy_addr()) == 0
  }

  async fn sleep_until(start: tokio::time::Instant, ms: u64) {
    tokio::time::sleep_until(start + Duration::from_millis(ms)).await
  }

  async fn eventually(f: impl Fn() -> bool) {
    for _ in 0..1_000 {
      if f() {
        return;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("gave up waiting")
  }

  /// Acknowledges every retransmitted message from inside `send`,
  /// like a peer in the same process would
  #[derive(Clone, Default)]
  struct Loopback {
    wire: Wire,
    core: Arc<Mutex<Option<Core<Loopback, Scheduler, runtime::Clock>>>>,
  }

  impl Transport for Loopback {
    type Error = ();

    fn send(&self, msg: Addrd<Message>) -> nb::Result<(), ()> {
      let retransmission = self.wire.count(|m| m == &msg) > 0;
      let ack = Addrd(Message::ack(msg.data().id), msg.addr());
      Transport::send(&self.wire, msg)?;

      let core = self.core.lock().unwrap().clone();
      match core {
        | Some(core) if retransmission => core.receive(ack),
        | _ => (),
      }

      Ok(())
    }
  }

  /// Panics instead of sending the `n`th message
  #[derive(Default)]
  struct Flaky {
    wire: Wire,
    n: usize,
    sends: AtomicUsize,
  }

  impl Transport for Flaky {
    type Error = ();

    fn send(&self, msg: Addrd<Message>) -> nb::Result<(), ()> {
      if self.sends.fetch_add(1, Ordering::SeqCst) + 1 == self.n {
        panic!("flaky transport");
      }

      Transport::send(&self.wire, msg)
    }
  }

  /// Shuts the core down the first time it is read
  #[derive(Debug, Clone)]
  struct ShutdownClock {
    start: tokio::time::Instant,
    core: Arc<Mutex<Option<Core<Wire, Scheduler, ShutdownClock>>>>,
  }

  impl embedded_time::Clock for ShutdownClock {
    type T = u64;

    const SCALING_FACTOR: Fraction = Fraction::new(1, 1_000);

    fn try_now(&self) -> Result<Instant<Self>, embedded_time::clock::Error> {
      let core = self.core.lock().unwrap().take();
      if let Some(core) = core {
        core.shutdown();
      }

      Ok(Instant::new(self.start.elapsed().as_millis() as u64))
    }
  }

  fn content(ty: Type) -> Message {
    Message::new(ty, Code::new(2, 5), Id(0), Token(Default::default()))
  }

  #[test]
  fn classify() {
    let cases = [(Message::ack(Id(1)), Inbound::EmptyAck),
                 (Message::reset(Id(1)), Inbound::Reset),
                 (test::piggy(1, 1, Code::new(2, 5)), Inbound::Response),
                 (test::separate(1, 1, Code::new(4, 4)), Inbound::Response),
                 (test::con_get(1, 1), Inbound::Request),
                 (test::non_get(1, 1), Inbound::Request),
                 (Message::new(Type::Con, EMPTY, Id(1), Token(Default::default())), Inbound::Ping),
                 (Message::new(Type::Ack, Code::new(0, 1), Id(1), test::token(1)),
                  Inbound::Unclassifiable),
                 (Message::new(Type::Con, Code::new(7, 0), Id(1), test::token(1)),
                  Inbound::Unclassifiable),
                 (Message::new(Type::Non, EMPTY, Id(1), Token(Default::default())),
                  Inbound::Unclassifiable)];

    cases.into_iter()
         .for_each(|(msg, expected)| assert_eq!(Inbound::classify(&msg), expected, "{:?}", msg));
  }

  #[tokio::test(start_paused = true)]
  async fn unanswered_con_is_retransmitted_then_times_out() {
    let (core, wire) = core_with(config());
    let log = Log::default();
    let start = tokio::time::Instant::now();

    core.send(Addrd(test::get(Type::Con), test::dummy_addr()), log.callback())
        .unwrap();
    assert_eq!(wire.sent().len(), 1);
    assert_eq!(log.happened(), vec![Happened::Transmission(0)]);

    sleep_until(start, 2_005).await;
    assert_eq!(wire.sent().len(), 2);

    sleep_until(start, 16_005).await;
    assert_eq!(wire.sent().len(), 5);
    assert!(wire.sent().windows(2).all(|w| w[0] == w[1]));
    assert_eq!(log.count(|h| h == &Happened::Timeout), 0);

    sleep_until(start, 32_005).await;
    assert_eq!(log.happened(),
               vec![Happened::Transmission(0),
                    Happened::Transmission(1),
                    Happened::Transmission(2),
                    Happened::Transmission(3),
                    Happened::Transmission(4),
                    Happened::Timeout]);
    assert!(settled(&core));

    sleep_until(start, 120_000).await;
    assert_eq!(wire.sent().len(), 5);
    assert_eq!(log.count(|h| h == &Happened::Timeout), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn piggybacked_response() {
    let (core, wire) = core_with(config());
    let log = Log::default();
    let start = tokio::time::Instant::now();

    let (token, id) = core.send(Addrd(test::get(Type::Con), test::dummy_addr()), log.callback())
                          .unwrap();
    assert_eq!(core.tokens().in_use(test::dummy_addr()), 1);
    assert!(core.ids().is_in_flight(test::dummy_addr(), id));

    core.receive(reply(Type::Ack, Code::new(2, 5), id, token));

    assert_eq!(log.happened(),
               vec![Happened::Transmission(0), Happened::Response(Code::new(2, 5), None)]);
    assert!(settled(&core));

    sleep_until(start, 10_000).await;
    assert_eq!(wire.sent().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn empty_ack_then_separate_response() {
    let (core, wire) = core_with(config());
    let log = Log::default();
    let start = tokio::time::Instant::now();

    let (token, id) = core.send(Addrd(test::get(Type::Con), test::dummy_addr()), log.callback())
                          .unwrap();

    core.receive(Addrd(Message::ack(id), test::dummy_addr()));
    assert_eq!(log.count(|h| h == &Happened::EmptyAck), 1);
    assert!(core.retransmitter().is_empty());
    assert_eq!(core.dispatch().len(), 1);

    sleep_until(start, 10_000).await;
    assert_eq!(wire.sent().len(), 1);
    wire.clear();

    core.receive(reply(Type::Con, Code::new(2, 5), Id(900), token));
    assert_eq!(log.count(|h| matches!(h, Happened::Response(..))), 1);
    assert_eq!(wire.sent(), vec![Addrd(Message::ack(Id(900)), test::dummy_addr())]);
    assert!(settled(&core));

    // the server didn't see our ACK
    core.receive(reply(Type::Con, Code::new(2, 5), Id(900), token));
    assert_eq!(log.count(|h| matches!(h, Happened::Response(..))), 1);
    assert_eq!(wire.sent().len(), 2);
    assert_eq!(wire.sent()[1], wire.sent()[0]);
    assert_eq!(core.stats().get(Anomaly::Duplicate), 1);
    assert_eq!(core.stats().get(Anomaly::MissingDispatchEntry), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn separate_response_before_empty_ack_stops_retransmission() {
    let (core, wire) = core_with(config());
    let log = Log::default();
    let start = tokio::time::Instant::now();

    let (token, _) = core.send(Addrd(test::get(Type::Con), test::dummy_addr()), log.callback())
                         .unwrap();
    core.receive(reply(Type::Non, Code::new(2, 5), Id(31), token));

    assert_eq!(log.count(|h| matches!(h, Happened::Response(..))), 1);
    assert!(settled(&core));

    sleep_until(start, 60_000).await;
    assert_eq!(wire.sent().len(), 1);
    assert_eq!(log.count(|h| h == &Happened::Timeout), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn reset_ends_exchange() {
    let (core, _) = core_with(config());
    let log = Log::default();

    let (_, id) = core.send(Addrd(test::get(Type::Con), test::dummy_addr()), log.callback())
                      .unwrap();
    core.receive(Addrd(Message::reset(id), test::dummy_addr()));

    assert_eq!(log.happened(), vec![Happened::Transmission(0), Happened::Reset]);
    assert!(settled(&core));

    core.receive(Addrd(Message::reset(id), test::dummy_addr()));
    assert_eq!(log.count(|h| h == &Happened::Reset), 1);
    assert_eq!(core.stats().get(Anomaly::MissingDispatchEntry), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn non_request_releases_id_immediately() {
    let (core, _) = core_with(config());
    let log = Log::default();

    let (token, _) = core.send(Addrd(test::get(Type::Non), test::dummy_addr()), log.callback())
                         .unwrap();

    assert_eq!(core.ids().in_flight(test::dummy_addr()), 0);
    assert!(core.retransmitter().is_empty());
    assert_eq!(core.dispatch().len(), 1);

    core.receive(reply(Type::Non, Code::new(2, 5), Id(40), token));
    assert_eq!(log.count(|h| matches!(h, Happened::Response(..))), 1);
    assert!(settled(&core));
  }

  #[tokio::test(start_paused = true)]
  async fn observation_ignores_stale_notifications() {
    let (core, wire) = core_with(config());
    let log = Log::default();
    let ok = Code::new(2, 5);

    let (token, id) = core.send(Addrd(test::get(Type::Con).with_observe(0), test::dummy_addr()),
                                log.callback())
                          .unwrap();

    core.receive(reply(Type::Ack, ok, id, token).map(|m| m.with_observe(5)));
    assert_eq!(core.dispatch().len(), 1);
    assert!(core.dispatch().is_observation(Addrd(token, test::dummy_addr())));

    core.receive(reply(Type::Non, ok, Id(100), token).map(|m| m.with_observe(3)));
    assert_eq!(core.stats().get(Anomaly::StaleNotification), 1);

    core.receive(reply(Type::Con, ok, Id(101), token).map(|m| m.with_observe(6)));
    assert_eq!(wire.count(|m| m.data() == &Message::ack(Id(101))), 1);
    assert_eq!(core.tokens().in_use(test::dummy_addr()), 1);

    core.receive(reply(Type::Con, Code::new(4, 4), Id(102), token));
    assert_eq!(wire.count(|m| m.data() == &Message::ack(Id(102))), 1);

    assert_eq!(log.happened(),
               vec![Happened::Transmission(0),
                    Happened::Response(ok, Some(5)),
                    Happened::Response(ok, Some(6)),
                    Happened::Response(Code::new(4, 4), None)]);
    assert!(settled(&core));
  }

  #[tokio::test(start_paused = true)]
  async fn cancelled_observation_rejects_notifications() {
    let (core, wire) = core_with(config());
    let log = Log::default();
    let ok = Code::new(2, 5);

    let (token, id) = core.send(Addrd(test::get(Type::Con).with_observe(0), test::dummy_addr()),
                                log.callback())
                          .unwrap();
    core.receive(reply(Type::Ack, ok, id, token).map(|m| m.with_observe(1)));

    assert!(core.cancel_observation(Addrd(token, test::dummy_addr())));
    assert!(!core.cancel_observation(Addrd(token, test::dummy_addr())));
    assert!(settled(&core));

    core.receive(reply(Type::Non, ok, Id(50), token).map(|m| m.with_observe(2)));
    assert_eq!(wire.count(|m| m.data() == &Message::reset(Id(50))), 1);
    assert_eq!(log.count(|h| matches!(h, Happened::Response(..))), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn unknown_separate_response_is_rejected() {
    let (core, wire) = core_with(config());

    core.receive(reply(Type::Con, Code::new(2, 5), Id(77), test::token(9)));

    assert_eq!(wire.sent(), vec![Addrd(Message::reset(Id(77)), test::dummy_addr())]);
    assert_eq!(core.stats().get(Anomaly::MissingDispatchEntry), 1);

    core.receive(reply(Type::Ack, Code::new(2, 5), Id(78), test::token(9)));
    assert_eq!(wire.sent().len(), 1);
    assert_eq!(core.stats().get(Anomaly::MissingDispatchEntry), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn many_endpoints_leave_nothing_behind() {
    let (core, _) = core_with(config());
    let log = Log::default();

    for port in 1..=100 {
      let (token, id) = core.send(Addrd(test::get(Type::Con), test::addr(port)), log.callback())
                            .unwrap();
      core.receive(Addrd(Message::new(Type::Ack, Code::new(2, 5), id, token), test::addr(port)));
    }

    assert_eq!(log.count(|h| matches!(h, Happened::Response(..))), 100);
    assert!(core.dispatch().is_empty());
    assert!(core.retransmitter().is_empty());
    assert!((1..=100).all(|port| core.tokens().in_use(test::addr(port)) == 0));
  }

  #[tokio::test(start_paused = true)]
  async fn message_id_exhaustion() {
    let mut config = config();
    config.msg.message_id_limit = 1;
    let (core, wire) = core_with(config);
    let log = Log::default();

    core.send(Addrd(test::get(Type::Con), test::dummy_addr()), log.callback())
        .unwrap();
    let err = core.send(Addrd(test::get(Type::Con), test::dummy_addr()), log.callback())
                  .unwrap_err();

    assert!(matches!(err.what, What::NoMessageIdAvailable(_)));
    assert_eq!(err.when, When::SendingRequest(test::dummy_addr()));

    let after = err.retry_after().unwrap();
    assert!(after.0 > 0);
    assert_eq!(log.count(|h| h == &Happened::NoMessageId(after.0)), 1);

    assert_eq!(core.tokens().in_use(test::dummy_addr()), 1);
    assert_eq!(core.dispatch().len(), 1);
    assert_eq!(wire.sent().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn token_exhaustion() {
    let mut config = config();
    config.msg.token_limit = 1;
    let (core, _) = core_with(config);
    let log = Log::default();

    core.send(Addrd(test::get(Type::Con), test::dummy_addr()), log.callback())
        .unwrap();
    let err = core.send(Addrd(test::get(Type::Con), test::dummy_addr()), log.callback())
                  .unwrap_err();

    assert!(matches!(err.what, What::NoTokenAvailable(_)));
    assert_eq!(err.retry_after(), None);
    assert_eq!(log.count(|h| h == &Happened::NoToken), 1);
    assert_eq!(core.ids().in_flight(test::dummy_addr()), 1);

    core.send(Addrd(test::get(Type::Con), test::addr(2)), log.callback())
        .unwrap();
  }

  #[tokio::test(start_paused = true)]
  async fn failed_send_is_rolled_back() {
    test::init_logging();
    let core = Core::new(config(),
                         runtime::Clock::new(),
                         Broken,
                         Scheduler::current(1).unwrap());
    let log = Log::default();

    for ty in [Type::Con, Type::Non] {
      let err = core.send(Addrd(test::get(ty), test::dummy_addr()), log.callback())
                    .unwrap_err();
      assert_eq!(err.what, What::Transport("unplugged"));
    }

    assert!(core.dispatch().is_empty());
    assert!(core.retransmitter().is_empty());
    assert_eq!(core.tokens().in_use(test::dummy_addr()), 0);
    assert_eq!(core.ids().in_flight(test::dummy_addr()), 0);
    assert_eq!(core.stats().get(Anomaly::TransportFailed), 2);
    assert!(log.happened().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn ping_is_reset() {
    let (core, wire) = core_with(config());

    core.receive(reply(Type::Con, EMPTY, Id(5), Token(Default::default())));

    assert_eq!(wire.sent(), vec![Addrd(Message::reset(Id(5)), test::dummy_addr())]);
  }

  #[tokio::test(start_paused = true)]
  async fn unclassifiable_messages_are_counted() {
    let (core, wire) = core_with(config());

    core.receive(reply(Type::Ack, Code::new(0, 1), Id(5), test::token(1)));
    core.receive(reply(Type::Non, Code::new(3, 0), Id(6), test::token(1)));

    assert!(wire.sent().is_empty());
    assert_eq!(core.stats().get(Anomaly::UnclassifiableMessage), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn panicking_callback_is_contained() {
    let (core, _) = core_with(config());

    let (token, id) = core.send(Addrd(test::get(Type::Con), test::dummy_addr()),
                                Callback::new(|_| panic!("boom")))
                          .unwrap();
    core.receive(reply(Type::Ack, Code::new(2, 5), id, token));

    assert_eq!(core.stats().get(Anomaly::CallbackPanicked), 1);
    assert!(settled(&core));
  }

  #[tokio::test(start_paused = true)]
  async fn shutdown_abandons_everything() {
    let (core, wire) = core_with(config());
    let log = Log::default();
    let start = tokio::time::Instant::now();

    let (token, _) = core.send(Addrd(test::get(Type::Con), test::dummy_addr()), log.callback())
                         .unwrap();
    core.send(Addrd(test::get(Type::Con), test::addr(2)), log.callback())
        .unwrap();

    core.shutdown();
    core.shutdown();
    assert!(core.is_shut_down());
    assert!(settled(&core));
    assert_eq!(core.tokens().in_use(test::addr(2)), 0);

    sleep_until(start, 60_000).await;
    assert_eq!(wire.sent().len(), 2);
    assert_eq!(log.count(|h| h == &Happened::Timeout), 0);

    core.receive(reply(Type::Con, Code::new(2, 5), Id(1), token));
    assert_eq!(wire.sent().len(), 2);

    let err = core.send(Addrd(test::get(Type::Con), test::dummy_addr()), log.callback())
                  .unwrap_err();
    assert_eq!(err.what, What::ShutDown);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn con_request_gets_piggybacked_response() {
    let (core, wire) = core_with(config());
    let calls = Arc::new(AtomicUsize::new(0));

    let calls_ = calls.clone();
    core.set_request_handler(move |req: Addrd<&Message>| {
          calls_.fetch_add(1, Ordering::SeqCst);
          Some(Message::new(Type::Non, Code::new(2, 5), Id(0), Token(Default::default()))
                 .with_payload(req.data().payload.clone()))
        });

    let req = Addrd(test::con_get(10, 3).with_payload(*b"hello"), test::dummy_addr());
    core.receive(req.clone());
    eventually(|| wire.sent().len() == 1).await;

    let rep = wire.sent()[0].clone();
    assert_eq!(rep.data().ty, Type::Ack);
    assert_eq!(rep.data().id, Id(10));
    assert_eq!(rep.data().token, test::token(3));
    assert_eq!(rep.data().code, Code::new(2, 5));
    assert_eq!(rep.data().payload, b"hello".to_vec());

    core.receive(req);
    assert_eq!(wire.sent().len(), 2);
    assert_eq!(wire.sent()[1], rep);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(core.stats().get(Anomaly::Duplicate), 1);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn non_request_gets_non_response() {
    let (core, wire) = core_with(config());

    core.set_request_handler(|_: Addrd<&Message>| {
          Some(Message::new(Type::Con, Code::new(2, 5), Id(0), Token(Default::default())))
        });

    core.receive(Addrd(test::non_get(11, 4), test::dummy_addr()));
    eventually(|| wire.sent().len() == 1).await;

    let rep = wire.sent()[0].clone();
    assert_eq!(rep.data().ty, Type::Non);
    assert_eq!(rep.data().token, test::token(4));
    assert_ne!(rep.data().id, Id(0));
    assert_eq!(core.ids().in_flight(test::dummy_addr()), 0);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn request_without_response_is_acked() {
    let (core, wire) = core_with(config());

    core.set_request_handler(|_: Addrd<&Message>| None);
    core.receive(Addrd(test::con_get(12, 5), test::dummy_addr()));
    eventually(|| wire.sent().len() == 1).await;
    assert_eq!(wire.sent()[0].data(), &Message::ack(Id(12)));

    core.set_request_handler(|_: Addrd<&Message>| -> Option<Message> { panic!("boom") });
    core.receive(Addrd(test::con_get(13, 5), test::dummy_addr()));
    eventually(|| wire.sent().len() == 2).await;
    assert_eq!(wire.sent()[1].data(), &Message::ack(Id(13)));
    assert_eq!(core.stats().get(Anomaly::CallbackPanicked), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn requests_are_rejected_without_handler() {
    let (core, wire) = core_with(config());

    core.receive(Addrd(test::con_get(12, 5), test::dummy_addr()));
    core.receive(Addrd(test::non_get(13, 5), test::dummy_addr()));

    assert_eq!(wire.sent(), vec![Addrd(Message::reset(Id(12)), test::dummy_addr())]);
  }

  #[tokio::test(start_paused = true)]
  async fn transport_may_answer_from_inside_send() {
    test::init_logging();
    let transport = Loopback::default();
    let core = Core::new(config(),
                         runtime::Clock::new(),
                         transport.clone(),
                         Scheduler::current(1).unwrap());
    *transport.core.lock().unwrap() = Some(core.clone());

    let log = Log::default();
    let start = tokio::time::Instant::now();

    core.send(Addrd(test::get(Type::Con), test::dummy_addr()), log.callback())
        .unwrap();

    sleep_until(start, 2_005).await;
    assert_eq!(transport.wire.sent().len(), 2);
    assert!(core.retransmitter().is_empty());
    assert_eq!(log.happened(),
               vec![Happened::Transmission(0), Happened::EmptyAck]);

    sleep_until(start, 60_000).await;
    assert_eq!(transport.wire.sent().len(), 2);
    assert_eq!(log.count(|h| h == &Happened::Timeout), 0);

    transport.core.lock().unwrap().take();
  }

  #[tokio::test(start_paused = true)]
  async fn panicking_transport_is_contained() {
    test::init_logging();
    let transport = Arc::new(Flaky { n: 2,
                                     ..Flaky::default() });
    let core = Core::new(config(),
                         runtime::Clock::new(),
                         transport.clone(),
                         Scheduler::current(1).unwrap());
    let log = Log::default();
    let start = tokio::time::Instant::now();

    let (token, id) = core.send(Addrd(test::get(Type::Con), test::dummy_addr()), log.callback())
                          .unwrap();

    // the first retransmission panics
    sleep_until(start, 2_005).await;
    assert_eq!(transport.wire.sent().len(), 1);

    core.receive(reply(Type::Ack, Code::new(2, 5), id, token));
    assert_eq!(log.count(|h| matches!(h, Happened::Response(..))), 1);
    assert!(settled(&core));

    core.send(Addrd(test::get(Type::Con), test::addr(2)), log.callback())
        .unwrap();
    assert_eq!(transport.wire.sent().len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn panicking_transport_fails_the_send() {
    test::init_logging();
    let core = Core::new(config(),
                         runtime::Clock::new(),
                         Flaky { n: 1,
                                 ..Flaky::default() },
                         Scheduler::current(1).unwrap());
    let log = Log::default();

    let err = core.send(Addrd(test::get(Type::Con), test::dummy_addr()), log.callback())
                  .unwrap_err();

    assert_eq!(err.what, What::TransportPanicked);
    assert!(settled(&core));
    assert_eq!(core.stats().get(Anomaly::TransportFailed), 1);
    assert!(log.happened().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn shutdown_during_send_abandons_the_request() {
    test::init_logging();
    let wire = Wire::new();
    let slot = Arc::new(Mutex::new(None));
    let clock = ShutdownClock { start: tokio::time::Instant::now(),
                                core: slot.clone() };
    let core = Core::new(config(), clock, wire.clone(), Scheduler::current(1).unwrap());
    *slot.lock().unwrap() = Some(core.clone());

    let log = Log::default();
    let start = tokio::time::Instant::now();

    let err = core.send(Addrd(test::get(Type::Con), test::dummy_addr()), log.callback())
                  .unwrap_err();

    assert_eq!(err.what, What::ShutDown);
    assert!(core.is_shut_down());
    assert!(core.dispatch().is_empty());
    assert!(core.retransmitter().is_empty());
    assert_eq!(core.tokens().in_use(test::dummy_addr()), 0);
    assert_eq!(core.ids().in_flight(test::dummy_addr()), 0);

    sleep_until(start, 60_000).await;
    assert!(wire.sent().is_empty());
    assert!(log.happened().is_empty());
    assert_eq!(core.stats().get(Anomaly::TokenNotReturned), 0);
    assert_eq!(core.stats().get(Anomaly::MessageIdNotReturned), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn requests_are_not_handled_after_shutdown() {
    let (core, wire) = core_with(config());
    let calls = Arc::new(AtomicUsize::new(0));

    let calls_ = calls.clone();
    let handler = move |_: Addrd<&Message>| {
      calls_.fetch_add(1, Ordering::SeqCst);
      Some(content(Type::Non))
    };

    core.shutdown();
    core.shared
        .handle_request(&handler, Addrd(test::con_get(12, 5), test::dummy_addr()));

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(wire.sent().is_empty());
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn concurrent_exchanges_leave_nothing_behind() {
    let (core, wire) = core_with(config());
    let log = Log::default();
    let mut tasks = vec![];

    for port in 1..=100u16 {
      let (tx, rx) = oneshot::channel();

      let (core_, log_) = (core.clone(), log.clone());
      tasks.push(tokio::spawn(async move {
                   let sent = core_.send(Addrd(test::get(Type::Con), test::addr(port)),
                                         log_.callback());
                   tx.send(sent.unwrap()).ok();
                 }));

      let core_ = core.clone();
      tasks.push(tokio::spawn(async move {
                   let (token, id) = rx.await.unwrap();
                   core_.receive(Addrd(Message::new(Type::Ack, Code::new(2, 5), id, token),
                                       test::addr(port)));
                 }));
    }

    for task in tasks {
      task.await.unwrap();
    }

    assert_eq!(log.count(|h| matches!(h, Happened::Response(..))), 100);
    assert_eq!(wire.sent().len(), 100);
    assert!(core.dispatch().is_empty());
    assert!(core.retransmitter().is_empty());
    assert!((1..=100).all(|port| {
                       core.tokens().in_use(test::addr(port)) == 0
                       && core.ids().in_flight(test::addr(port)) == 0
                     }));
    assert_eq!(core.stats().get(Anomaly::MissingDispatchEntry), 0);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn observers_are_notified_until_they_reset() {
    let (core, wire) = core_with(config());
    core.set_request_handler(|req: Addrd<&Message>| {
          Some(content(Type::Non).with_payload(req.data().path.clone()))
        });

    let key = Addrd(test::token(6), test::dummy_addr());
    core.receive(Addrd(test::con_get(20, 6).with_observe(0).with_path("temp"),
                       test::dummy_addr()));
    eventually(|| wire.sent().len() == 1).await;

    let registered = wire.sent()[0].clone();
    assert_eq!(registered.data().ty, Type::Ack);
    assert_eq!(registered.data().observe, Some(0));
    assert_eq!(core.subscribers().observing("temp"), 1);
    assert!(core.subscribers().get(key).is_some());

    assert_eq!(core.notify("humidity", content(Type::Non)), 0);
    assert_eq!(core.notify("temp", content(Type::Non).with_payload(*b"21C")), 1);
    assert_eq!(core.notify("temp", content(Type::Ack).with_payload(*b"22C")), 1);

    let sent = wire.sent();
    assert_eq!(sent.len(), 3);
    let (a, b) = (sent[1].data(), sent[2].data());
    assert_eq!((a.ty, a.token, a.observe), (Type::Non, test::token(6), Some(1)));
    assert_eq!((b.ty, b.token, b.observe), (Type::Non, test::token(6), Some(2)));
    assert_eq!(b.payload, b"22C".to_vec());
    assert_ne!(a.id, b.id);
    assert_eq!(core.ids().in_flight(test::dummy_addr()), 0);

    core.receive(Addrd(Message::reset(b.id), test::dummy_addr()));
    assert!(core.subscribers().is_empty());
    assert_eq!(core.notify("temp", content(Type::Non)), 0);
    assert_eq!(core.stats().get(Anomaly::MissingDispatchEntry), 0);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn observers_may_deregister() {
    let (core, wire) = core_with(config());
    core.set_request_handler(|req: Addrd<&Message>| {
          let code = match req.data().path.as_str() {
            | "temp" => Code::new(2, 5),
            | _ => Code::new(4, 4),
          };
          Some(Message::new(Type::Non, code, Id(0), Token(Default::default())))
        });

    core.receive(Addrd(test::con_get(20, 6).with_observe(0).with_path("temp"),
                       test::dummy_addr()));
    eventually(|| wire.sent().len() == 1).await;
    assert_eq!(core.subscribers().len(), 1);

    // errors don't register
    core.receive(Addrd(test::con_get(21, 7).with_observe(0).with_path("nope"),
                       test::dummy_addr()));
    eventually(|| wire.sent().len() == 2).await;
    assert_eq!(wire.sent()[1].data().observe, None);
    assert_eq!(core.subscribers().len(), 1);

    core.receive(Addrd(test::con_get(22, 6).with_observe(1).with_path("temp"),
                       test::dummy_addr()));
    eventually(|| wire.sent().len() == 3).await;
    assert!(core.subscribers().is_empty());
    assert_eq!(wire.sent()[2].data().observe, None);
  }

  #[tokio::test(start_paused = true)]
  async fn unacknowledged_con_notification_unsubscribes() {
    let (core, wire) = core_with(config());
    let start = tokio::time::Instant::now();
    let acks = Addrd(test::token(6), test::dummy_addr());
    let silent = Addrd(test::token(7), test::addr(2));

    core.subscribers().subscribe(acks, "temp");
    core.subscribers().subscribe(silent, "temp");

    assert_eq!(core.notify("temp", content(Type::Con)), 2);
    assert_eq!(core.retransmitter().len(), 2);

    let to_acks = wire.sent()
                      .into_iter()
                      .find(|m| m.addr() == test::dummy_addr())
                      .unwrap();
    assert_eq!(to_acks.data().ty, Type::Con);
    core.receive(Addrd(Message::ack(to_acks.data().id), test::dummy_addr()));
    assert_eq!(core.retransmitter().len(), 1);

    sleep_until(start, 2_005).await;
    assert_eq!(wire.count(|m| m.addr() == test::addr(2)), 2);
    assert_eq!(wire.count(|m| m.addr() == test::dummy_addr()), 1);

    sleep_until(start, 32_005).await;
    assert!(core.subscribers().get(silent).is_none());
    assert!(core.subscribers().get(acks).is_some());
    assert!(core.retransmitter().is_empty());
    assert_eq!(core.ids().in_flight(test::addr(2)), 0);
    assert_eq!(core.stats().get(Anomaly::MissingDispatchEntry), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn newer_con_notification_replaces_unacknowledged_one() {
    let (core, wire) = core_with(config());
    let start = tokio::time::Instant::now();
    core.subscribers()
        .subscribe(Addrd(test::token(6), test::dummy_addr()), "temp");

    core.notify("temp", content(Type::Con));
    core.notify("temp", content(Type::Con));

    assert_eq!(core.retransmitter().len(), 1);
    assert_eq!(core.ids().in_flight(test::dummy_addr()), 1);

    sleep_until(start, 2_005).await;
    let sent = wire.sent();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[2], sent[1]);
    assert_eq!(sent[2].data().observe, Some(2));
  }
}
