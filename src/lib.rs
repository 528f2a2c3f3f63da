//! Ratekeeper - Request Rate Limiting Middleware
//!
//! This crate decides, per incoming request, whether to allow or reject it based
//! on recent request volume from a client IP or API token. Counters and block
//! markers live in a shared store (in-memory for tests and single instances,
//! Redis for shared deployments) and expire through the store's own TTLs.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod storage;
