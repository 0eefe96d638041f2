//! MultiFleet - Run and coordinate many instances of single-instance applications
//!
//! Holds the singleton objects a client uses to refuse a second copy, launches and supervises
//! one instance per account, and fans coordinated commands out to follower instances.

pub mod core;
pub mod persistence;
pub mod platform;

/// Application name constant
pub const APP_NAME: &str = "MultiFleet";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
