//! A client for a RESP key/value and pub/sub server.
//!
//! Two entry points are provided. [`Client`] multiplexes concurrent callers
//! onto a single pipelined connection: frames are written under an exclusive
//! write slot and responses are matched back to callers in strict send order.
//! [`Listener`] maintains a dedicated pub/sub connection that reconnects
//! automatically and keeps the declared subscription set consistent with the
//! server across connection loss.

mod connection;
mod error;
mod frame;
mod handshake;
mod parse;
mod request;
mod shutdown;

pub mod client;
pub mod listener;

#[doc(inline)]
pub use client::{Client, Config};

#[doc(inline)]
pub use error::{Error, Result};

#[doc(inline)]
pub use frame::Frame;

#[doc(inline)]
pub use listener::{Listener, Subscription};

/// Default port that the server listens on.
pub const DEFAULT_PORT: &str = "6379";
