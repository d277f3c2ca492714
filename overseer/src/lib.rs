//! Overseer: supervisor daemon for a fleet of cooperating services.
//!
//! Keeps each service's health current from the freshness of the artifact it
//! writes, brings services up in dependency order once their upstreams are
//! ready, and applies bounded remediation when a service goes red. All
//! coordination with the services happens through files under the shared
//! state directory.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// `overseer.toml` loading and validation.
pub mod config;
/// The supervision loop.
pub mod monitor;
/// Health probes run each tick.
pub mod probes;
/// Child process launching.
pub mod spawner;
