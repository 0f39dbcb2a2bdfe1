//! Local cache daemon shared by independent client processes on one host.
//!
//! A client opens one connection per call, sends a JSON request such as
//! `{"action":"get","table":"movies","name":"title"}` through the chunked
//! [`transport`], and reads back either a string, a list of strings, or the
//! flags `"true"`/`"false"`. Writes get no reply. Each module focuses on a
//! concrete responsibility:
//!
//! - [`store`] keeps per-table key/value rows in SQLite and heals a corrupt
//!   database file by recreating it.
//! - [`lock`] layers advisory locks over store entries, reclaiming locks left
//!   behind by an earlier server process.
//! - [`transport`] moves one message over a byte stream in acknowledged chunks.
//! - [`message`] defines the JSON request/response shapes.
//! - [`dispatcher`] routes a decoded request to the store or lock manager.
//! - [`server`] accepts one connection at a time and enforces idle shutdown.
//! - [`client`] and [`memo`] are the caller side: one connection per call,
//!   plus TTL-based memoization of function results.
//! - [`endpoint`], [`config`], [`cli`], and [`host`] cover sockets, settings,
//!   the command line, and injected host services.
//!
//! Integration tests drive a real server through the client API.

pub mod cli;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod host;
pub mod lock;
pub mod memo;
pub mod message;
pub mod server;
pub mod store;
pub mod transport;
