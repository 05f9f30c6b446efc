//! metafetch library
//!
//! Coalesced, cached and rate-limited access to metadata APIs. A
//! [`request::Client`] ties together the [`api::ApiRegistry`], a
//! [`cache::CacheStore`], a [`locker::KeyLocker`] and a
//! [`transport::Transport`].

pub mod api;
pub mod cache;
pub mod cli;
pub mod config;
pub mod limiter;
pub mod locker;
pub mod request;
pub mod trace;
pub mod transport;

pub use api::{ApiConfig, ApiIdent, ApiRegistry, RetryScope};
pub use request::{Client, Request, RequestError, Response};
