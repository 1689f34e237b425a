use std::net::SocketAddr;

use crate::id::NoMessageIdAvailable;
use crate::time::Millis;
use crate::token::NoTokenAvailable;

/// The context that an error occurred in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum When {
  /// We were sending a request
  SendingRequest(SocketAddr),
  /// We were replying to a message
  Replying(SocketAddr),
}

impl When {
  /// Construct a specific error from the context the error occurred in
  pub fn what<E>(self, what: What<E>) -> Error<E> {
    Error { when: self, what }
  }
}

/// An error encounterable from within Core
#[derive(Debug, Clone, PartialEq)]
pub struct Error<E> {
  /// What happened?
  pub what: What<E>,
  /// What were we doing when it happened?
  pub when: When,
}

impl<E> Error<E> {
  /// If this was caused by message id exhaustion, how long
  /// to wait before trying again
  pub fn retry_after(&self) -> Option<Millis> {
    match self.what {
      | What::NoMessageIdAvailable(NoMessageIdAvailable { retry_after, .. }) => Some(retry_after),
      | _ => None,
    }
  }
}

/// A contextless error with some additional debug data attached.
#[derive(Clone, PartialEq)]
pub enum What<E> {
  /// The destination owns too many tokens
  NoTokenAvailable(NoTokenAvailable),
  /// Too many message ids are in flight to the destination
  NoMessageIdAvailable(NoMessageIdAvailable),
  /// The transport failed to send the message
  Transport(E),
  /// The transport can't accept a message right now
  TransportBusy,
  /// The transport panicked while sending the message
  TransportPanicked,
  /// [`Core::shutdown`](super::Core::shutdown) was invoked
  ShutDown,
  /// The clock failed to provide timing.
  ///
  /// See [`embedded_time::clock::Error`]
  ClockError,
}

impl<E: core::fmt::Debug> core::fmt::Debug for What<E> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    match self {
      | Self::NoTokenAvailable(e) => e.fmt(f),
      | Self::NoMessageIdAvailable(e) => e.fmt(f),
      | Self::Transport(e) => f.debug_tuple("Transport").field(e).finish(),
      | Self::TransportBusy => f.debug_tuple("TransportBusy").finish(),
      | Self::TransportPanicked => f.debug_tuple("TransportPanicked").finish(),
      | Self::ShutDown => f.debug_tuple("ShutDown").finish(),
      | Self::ClockError => f.debug_tuple("ClockError").finish(),
    }
  }
}

impl<E> From<NoTokenAvailable> for What<E> {
  fn from(e: NoTokenAvailable) -> Self {
    What::NoTokenAvailable(e)
  }
}

impl<E> From<NoMessageIdAvailable> for What<E> {
  fn from(e: NoMessageIdAvailable) -> Self {
    What::NoMessageIdAvailable(e)
  }
}

impl<E> From<nb::Error<E>> for What<E> {
  fn from(e: nb::Error<E>) -> Self {
    match e {
      | nb::Error::WouldBlock => What::TransportBusy,
      | nb::Error::Other(e) => What::Transport(e),
    }
  }
}
