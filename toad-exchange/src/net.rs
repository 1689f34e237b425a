use std::net::SocketAddr;

use tinyvec::ArrayVec;
use toad_msg::Token;

use crate::msg::Message;

/// Data that came from (or is headed to) a network socket
#[derive(PartialEq, PartialOrd, Eq, Ord, Hash, Debug, Clone, Copy)]
pub struct Addrd<T>(pub T, pub SocketAddr);

impl<T> Addrd<T> {
  /// Borrow the contents of this Addressed
  pub fn as_ref(&self) -> Addrd<&T> {
    Addrd(self.data(), self.addr())
  }

  /// Discard the socket and get the data in this Addressed
  pub fn unwrap(self) -> T {
    self.0
  }

  /// Map the data contained in this Addressed
  pub fn map<R>(self, f: impl FnOnce(T) -> R) -> Addrd<R> {
    Addrd(f(self.0), self.1)
  }

  /// Borrow the contents of the addressed item
  pub fn data(&self) -> &T {
    &self.0
  }

  /// Copy the socket address for the data
  pub fn addr(&self) -> SocketAddr {
    self.1
  }

  /// Turn the entire structure into something else
  pub fn fold<R>(self, f: impl FnOnce(T, SocketAddr) -> R) -> R {
    f(self.0, self.1)
  }
}

impl<T> AsMut<T> for Addrd<T> {
  fn as_mut(&mut self) -> &mut T {
    &mut self.0
  }
}

/// [`Token`] does not impl `Ord`, so tables keyed
/// on tokens use the token's bytes instead.
pub(crate) type TokenBytes = ArrayVec<[u8; 8]>;

impl Addrd<Token> {
  pub(crate) fn key(&self) -> Addrd<TokenBytes> {
    Addrd(self.0 .0, self.1)
  }
}

/// Something that can put decoded messages on the wire.
///
/// Encoding is the transport's business; the exchange layer
/// only ever hands it whole messages addressed to a remote endpoint.
///
/// Sends must not block. A transport that cannot accept a message
/// right now should yield [`nb::Error::WouldBlock`].
pub trait Transport: Send + Sync + 'static {
  /// The error yielded when a message could not be sent
  type Error: core::fmt::Debug + Send;

  /// Send a message to a remote address
  fn send(&self, msg: Addrd<Message>) -> nb::Result<(), Self::Error>;
}

/// The receiving half of a channel transport was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Closed;

impl Transport for tokio::sync::mpsc::UnboundedSender<Addrd<Message>> {
  type Error = Closed;

  fn send(&self, msg: Addrd<Message>) -> nb::Result<(), Self::Error> {
    tokio::sync::mpsc::UnboundedSender::send(self, msg).map_err(|_| nb::Error::Other(Closed))
  }
}

impl Transport for tokio::sync::mpsc::Sender<Addrd<Message>> {
  type Error = Closed;

  fn send(&self, msg: Addrd<Message>) -> nb::Result<(), Self::Error> {
    use tokio::sync::mpsc::error::TrySendError;

    self.try_send(msg).map_err(|e| match e {
                        | TrySendError::Full(_) => nb::Error::WouldBlock,
                        | TrySendError::Closed(_) => nb::Error::Other(Closed),
                      })
  }
}

/// Hand `msg` to `transport`, yielding `None` if the transport panicked.
pub(crate) fn send_contained<T: Transport>(transport: &T,
                                           msg: Addrd<Message>)
                                           -> Option<nb::Result<(), T::Error>> {
  std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| transport.send(msg))).ok()
}

impl<T: Transport> Transport for std::sync::Arc<T> {
  type Error = T::Error;

  fn send(&self, msg: Addrd<Message>) -> nb::Result<(), Self::Error> {
    T::send(self, msg)
  }
}
