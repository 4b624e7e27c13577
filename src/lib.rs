//! Gatekeeper - Sliding Window Admission Control
//!
//! This crate decides, per client, whether an incoming request may proceed.
//! Each client key gets an independent quota of `limit` requests within any
//! trailing `window`; idle clients are swept from memory by a cancellable
//! background task.

pub mod config;
pub mod error;
pub mod frontend;
pub mod ratelimit;
