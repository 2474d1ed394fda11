//! Health monitoring integration tests
//!
//! Runs the ping loop against fleet instances on a paused clock:
//! - steady pings and bounded history
//! - backoff while failing, recovery to the base interval
//! - fleet-wide health summaries and shutdown
