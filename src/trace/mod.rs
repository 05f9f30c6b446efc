//! Timing traces for cache and request diagnostics
//!
//! A [`Tracer`] records named stages of an operation. Cache actions wrap it in a
//! [`CacheTrace`]; requests render their own report around it. Traces are only
//! logged when the matching tracing switch is enabled.

mod cache;
mod tracer;

pub use cache::CacheTrace;
pub use tracer::{human_bytes, Tracer};
