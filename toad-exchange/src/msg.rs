//! A decoded CoAP message, as seen by the exchange layer.
//!
//! Encoding & decoding happen elsewhere; this is only the part of a
//! message that matters for reliability & correlation.

use toad_msg::{Code, Id, Token, Type};

/// Empty code `0.00`
pub const EMPTY: Code = Code::new(0, 0);

/// Largest value an observe sequence number can take (24 bits)
pub const OBSERVE_MAX: u32 = (1 << 24) - 1;

/// The kind of a message, as far as routing is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
  /// `0.00`
  Empty,
  /// `0.01` through `0.31`
  Request,
  /// `2.xx`, `4.xx` and `5.xx`
  Response,
  /// Reserved code classes
  Reserved,
}

/// A decoded message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
  /// CON / NON / ACK / RST
  pub ty: Type,
  /// Method, response code, or empty
  pub code: Code,
  /// Message id
  pub id: Id,
  /// Request / response correlation token
  pub token: Token,
  /// Value of the Observe option, if present
  pub observe: Option<u32>,
  /// Uri-Path options joined with `/`, e.g. `sensors/temp`
  pub path: String,
  /// Message payload
  pub payload: Vec<u8>,
}

impl Message {
  /// Create a new message with no observe option, path or payload
  pub fn new(ty: Type, code: Code, id: Id, token: Token) -> Self {
    Self { ty,
           code,
           id,
           token,
           observe: None,
           path: String::new(),
           payload: vec![] }
  }

  /// An empty ACK for the message with id `id`
  pub fn ack(id: Id) -> Self {
    Self::new(Type::Ack, EMPTY, id, Token(Default::default()))
  }

  /// A RST for the message with id `id`
  pub fn reset(id: Id) -> Self {
    Self::new(Type::Reset, EMPTY, id, Token(Default::default()))
  }

  /// Set the observe sequence number
  pub fn with_observe(mut self, seq: u32) -> Self {
    self.observe = Some(seq & OBSERVE_MAX);
    self
  }

  /// Set the resource path
  pub fn with_path(mut self, path: impl Into<String>) -> Self {
    self.path = path.into();
    self
  }

  /// Set the payload
  pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
    self.payload = payload.into();
    self
  }

  /// Classify this message's code
  pub fn kind(&self) -> Kind {
    match (self.code.class, self.code.detail) {
      | (0, 0) => Kind::Empty,
      | (0, _) => Kind::Request,
      | (2 | 4 | 5, _) => Kind::Response,
      | _ => Kind::Reserved,
    }
  }

  /// Is this an empty message? (code `0.00`)
  pub fn is_empty(&self) -> bool {
    self.kind() == Kind::Empty
  }

  /// Is this message a request?
  pub fn is_request(&self) -> bool {
    self.kind() == Kind::Request
  }

  /// Is this message a response?
  pub fn is_response(&self) -> bool {
    self.kind() == Kind::Response
  }

  /// Is this a `4.xx` or `5.xx` response?
  pub fn is_error(&self) -> bool {
    self.is_response() && self.code.class >= 4
  }

  /// Is this a successful observe notification?
  ///
  /// Error responses carrying an observe option end
  /// the observation, so they are not notifications.
  pub fn is_notification(&self) -> bool {
    self.is_response() && !self.is_error() && self.observe.is_some()
  }

  /// Is this a confirmable message?
  pub fn is_con(&self) -> bool {
    self.ty == Type::Con
  }
}
