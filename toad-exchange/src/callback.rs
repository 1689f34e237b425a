//! What to do when something happens to an exchange we started.
//!
//! A [`Callback`] always handles responses. Everything else is
//! opt-in: an event the callback has no handler for is logged
//! and otherwise ignored.
//!
//! ```
//! use toad_exchange::callback::Callback;
//!
//! let cb = Callback::new(|rep| println!("{:?} from {}", rep.data().code, rep.addr()))
//!            .on_timeout(|tk| println!("{:?} to {} timed out", tk.data(), tk.addr()))
//!            .on_reset(|id| println!("{:?} was rejected", id));
//!
//! assert!(cb.handles_timeout());
//! assert!(!cb.handles_empty_ack());
//! ```

use std::net::SocketAddr;

use toad_msg::{Id, Token};

use crate::msg::Message;
use crate::net::Addrd;
use crate::retry::Attempts;
use crate::time::Millis;

/// A request was put on the wire
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transmission {
  /// Destination
  pub addr: SocketAddr,
  /// The request's token
  pub token: Token,
  /// The request's message id
  pub id: Id,
  /// Number of times the request was sent before this
  pub attempt: Attempts,
}

impl Transmission {
  /// Is this a retransmission?
  pub fn is_retransmission(&self) -> bool {
    self.attempt > Attempts(0)
  }
}

type Handler<T> = Box<dyn Fn(T) + Send + Sync>;
type ResponseHandler = Box<dyn for<'a> Fn(Addrd<&'a Message>) + Send + Sync>;

/// Handlers for everything that can happen to an outbound request
pub struct Callback {
  on_response: ResponseHandler,
  on_empty_ack: Option<Handler<Addrd<Id>>>,
  on_reset: Option<Handler<Addrd<Id>>>,
  on_timeout: Option<Handler<Addrd<Token>>>,
  on_transmission: Option<Handler<Transmission>>,
  on_no_token: Option<Handler<SocketAddr>>,
  on_no_message_id: Option<Handler<(SocketAddr, Millis)>>,
}

impl core::fmt::Debug for Callback {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Callback")
     .field("on_empty_ack", &self.handles_empty_ack())
     .field("on_reset", &self.handles_reset())
     .field("on_timeout", &self.handles_timeout())
     .field("on_transmission", &self.handles_transmission())
     .field("on_no_token", &self.on_no_token.is_some())
     .field("on_no_message_id", &self.on_no_message_id.is_some())
     .finish()
  }
}

impl Callback {
  /// Create a callback that only handles responses
  pub fn new<F>(on_response: F) -> Self
    where F: for<'a> Fn(Addrd<&'a Message>) + Send + Sync + 'static
  {
    Self { on_response: Box::new(on_response),
           on_empty_ack: None,
           on_reset: None,
           on_timeout: None,
           on_transmission: None,
           on_no_token: None,
           on_no_message_id: None }
  }

  /// The request was acknowledged, and the response will come separately
  pub fn on_empty_ack(mut self, f: impl Fn(Addrd<Id>) + Send + Sync + 'static) -> Self {
    self.on_empty_ack = Some(Box::new(f));
    self
  }

  /// The request was rejected with RST
  pub fn on_reset(mut self, f: impl Fn(Addrd<Id>) + Send + Sync + 'static) -> Self {
    self.on_reset = Some(Box::new(f));
    self
  }

  /// We gave up on the request after retransmitting it
  pub fn on_timeout(mut self, f: impl Fn(Addrd<Token>) + Send + Sync + 'static) -> Self {
    self.on_timeout = Some(Box::new(f));
    self
  }

  /// The request was sent, or sent again
  pub fn on_transmission(mut self, f: impl Fn(Transmission) + Send + Sync + 'static) -> Self {
    self.on_transmission = Some(Box::new(f));
    self
  }

  /// The request could not be sent because its destination
  /// owns too many tokens
  pub fn on_no_token(mut self, f: impl Fn(SocketAddr) + Send + Sync + 'static) -> Self {
    self.on_no_token = Some(Box::new(f));
    self
  }

  /// The request could not be sent because too many message ids
  /// are in flight to its destination. The handler is told how long
  /// to wait before trying again.
  pub fn on_no_message_id(mut self,
                          f: impl Fn(SocketAddr, Millis) + Send + Sync + 'static)
                          -> Self {
    self.on_no_message_id = Some(Box::new(move |(addr, after)| f(addr, after)));
    self
  }

  #[allow(missing_docs)]
  pub fn handles_empty_ack(&self) -> bool {
    self.on_empty_ack.is_some()
  }

  #[allow(missing_docs)]
  pub fn handles_reset(&self) -> bool {
    self.on_reset.is_some()
  }

  #[allow(missing_docs)]
  pub fn handles_timeout(&self) -> bool {
    self.on_timeout.is_some()
  }

  #[allow(missing_docs)]
  pub fn handles_transmission(&self) -> bool {
    self.on_transmission.is_some()
  }

  pub(crate) fn response(&self, msg: Addrd<&Message>) {
    (self.on_response)(msg)
  }

  pub(crate) fn empty_ack(&self, id: Addrd<Id>) -> bool {
    self.on_empty_ack.as_ref().map(|f| f(id)).is_some()
  }

  pub(crate) fn reset(&self, id: Addrd<Id>) -> bool {
    self.on_reset.as_ref().map(|f| f(id)).is_some()
  }

  pub(crate) fn timeout(&self, token: Addrd<Token>) -> bool {
    self.on_timeout.as_ref().map(|f| f(token)).is_some()
  }

  pub(crate) fn transmission(&self, t: Transmission) -> bool {
    self.on_transmission.as_ref().map(|f| f(t)).is_some()
  }

  pub(crate) fn no_token(&self, addr: SocketAddr) -> bool {
    self.on_no_token.as_ref().map(|f| f(addr)).is_some()
  }

  pub(crate) fn no_message_id(&self, addr: SocketAddr, retry_after: Millis) -> bool {
    self.on_no_message_id
        .as_ref()
        .map(|f| f((addr, retry_after)))
        .is_some()
  }
}
