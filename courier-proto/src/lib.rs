//! Shared protocol definitions for the `Courier` wire format.

pub mod frame;
pub mod message;
pub mod topic;
