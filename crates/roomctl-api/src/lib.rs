//! Thin transport layer for talking to a networked AV control processor.
//!
//! This crate intentionally carries no business logic: [`rest`] exposes a
//! typed HTTP client with retry/timeout policy, [`channel`] exposes a
//! duplex JSON message channel with no reconnect logic of its own, and
//! [`deferred`] provides the one-shot awaitable both of them (and the
//! `roomctl-core` crate built on top) use to bridge external completion
//! into `async`/`await`.

pub mod channel;
pub mod deferred;
pub mod error;
pub mod rest;

pub use channel::{ChannelEvent, MessageChannel};
pub use deferred::Deferred;
pub use error::Error;
pub use rest::{RequestOptions, RestClient, RestClientConfig};
