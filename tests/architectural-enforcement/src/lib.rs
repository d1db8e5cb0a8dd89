//! Architectural Enforcement Integration Tests
//!
//! Source-level policies for `gateway/core/src`, checked in `tests/`:
//! - No sleep() calls in production code
//! - No blocking file or network I/O in async code
