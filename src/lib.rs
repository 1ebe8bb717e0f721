//! Turnstile - Request Admission Gateway
//!
//! This crate decides whether an inbound request is admitted based on a
//! per-identifier counter kept in a pluggable store. Requests are identified
//! by their `API_KEY` token when present and by peer address otherwise.
//! Identifiers that exceed their threshold are blocked for a fixed period,
//! and any store failure is treated as a denial.

pub mod config;
pub mod error;
pub mod gateway;
pub mod ratelimit;
