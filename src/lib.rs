//! stratodb - a hosted data-platform backend
//!
//! This crate carries the real-time live query engine: subscription
//! dispatch, query matching, and per-subscriber authorization.

pub mod auth;
pub mod livequery;
pub mod observability;
