//! `Courier`: real-time message delivery and reconciliation library.
//!
//! Merges fetched history, optimistic local sends and server pushes into
//! one ordered, duplicate-free timeline per two-party conversation, over a
//! publish/subscribe connection that reconnects on its own.

pub mod chat;
pub mod config;
pub mod facade;
pub mod history;
pub mod net;
pub mod observe;
pub mod transport;
