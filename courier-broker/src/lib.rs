//! `Courier` broker library.
//!
//! Exposes the broker for use in tests and embedding. The broker accepts
//! WebSocket sessions, lets each user subscribe to their own message topic,
//! stamps published records with ids, keeps a bounded per-conversation
//! history, and serves that history over HTTP.

pub mod broker;
pub mod config;
pub mod store;
