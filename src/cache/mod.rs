//! Permission caching layer.
//!
//! This module provides the TTL cache that sits between the resolver and the
//! membership store:
//!
//! - **Coarse map**: `(user, academy)` to membership, with a negative
//!   sentinel for known non-members
//! - **Fine map**: `(user, academy, department)` to effective permission set
//! - **Single-flight**: concurrent misses on a key coalesce to one load
//! - **Synchronous invalidation** with broadcast invalidation events
//! - **Injected clock** so TTL behavior is testable

pub mod clock;
pub mod invalidation;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use invalidation::{InvalidationEvent, InvalidationPublisher};
pub use store::{CacheStats, PermissionCache};
