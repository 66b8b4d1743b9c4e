//! Wire-level vocabulary shared by the router and the proxy engine.
//!
//! This crate intentionally does **not** depend on axum or any HTTP client.
//! It owns the closed set of route capabilities, the SSE frame parser used by
//! the streaming tee, and the per-family usage extraction.

pub mod capability;
pub mod sse;
pub mod usage;

pub use capability::{Classified, ProviderFamily, RouteCapability, classify_path, classify_request};
pub use sse::{SseFrame, SseFrameParser};
pub use usage::{UsageCounters, UsageTail, extract_usage};
