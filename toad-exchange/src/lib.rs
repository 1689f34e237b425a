//! `toad-exchange` is the message exchange layer of a CoAP endpoint.
//!
//! It sits between an application that wants to talk CoAP and a transport
//! that can put messages on the wire, and takes care of everything
//! [RFC7252](https://datatracker.ietf.org/doc/html/rfc7252) and
//! [RFC7641](https://datatracker.ietf.org/doc/html/rfc7641) ask of
//! an endpoint between those two:
//!
//! - issuing [tokens](crate::token) and [message ids](crate::id) that are unique per remote endpoint
//! - [retransmitting](crate::retransmit) confirmable requests with exponential backoff until they're acknowledged (or it's time to give up)
//! - [routing](crate::dispatch) inbound responses back to whoever is waiting for them, by token
//! - keeping [observations](crate::observe) alive and dropping notifications that arrive out of order
//! - notifying [subscribers](crate::subscribe) when a resource of ours changes
//! - handing inbound requests to a [handler](crate::core::RequestHandler) on a bounded worker pool
//!
//! ## CoAP
//! CoAP is an application-level network protocol that copies the semantics of HTTP
//! to an environment conducive to **constrained** devices. (weak hardware, small battery capacity, etc.)
//!
//! Because CoAP customarily sits on top of UDP, nothing guarantees that a message
//! arrives, arrives once, or arrives in order. The exchange layer is what turns
//! "throw a datagram at someone" into "send a request, get exactly one answer".
//!
//! ### Message types
//! - **CON** (confirmable) messages must be acknowledged; they are retransmitted until they are
//! - **NON** (non-confirmable) messages are fire and forget
//! - **ACK** acknowledges a CON, and may carry ("piggyback") the response to a request
//! - **RST** says "I don't know what you're talking about"
//!
//! ## Usage
//! The entry point is [`Core`](crate::core::Core). See [`runtime`] for running it on tokio.

// -
// style
#![allow(clippy::unused_unit)]
#![cfg_attr(any(docsrs, feature = "docs"), feature(doc_cfg))]
// -
// deny
#![deny(missing_debug_implementations)]
#![cfg_attr(not(test), deny(unsafe_code))]
// -
// warnings
#![warn(missing_docs)]
#![warn(missing_copy_implementations)]
#![cfg_attr(not(test), warn(unreachable_pub))]


pub(crate) mod logging;

/// What to do when something happens to a request we sent
pub mod callback;

/// configuring runtime behavior
pub mod config;

/// The exchange layer
pub mod core;

/// Recognizing retransmitted inbound messages
pub mod dedupe;

/// Routing responses to the requests they answer
pub mod dispatch;

/// Message ids
pub mod id;

/// The parts of a CoAP message the exchange layer cares about
pub mod msg;

/// network primitives
pub mod net;

/// Notification ordering
pub mod observe;

/// Retransmission of confirmable messages
pub mod retransmit;

/// customizable retrying of fallible operations
pub mod retry;

/// tokio integration
pub mod runtime;

/// Deferred & background work
pub mod schedule;

/// Counters for things that should not happen
pub mod stats;

/// Observers of our own resources
pub mod subscribe;

/// time abstractions
pub mod time;

/// Tokens
pub mod token;

#[doc(inline)]
pub use crate::core::{Core, RequestHandler};
