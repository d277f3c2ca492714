//! Steward: filesystem-mediated coordination for cooperating processes.
//!
//! Independent processes (feeder, signal engine, executor, supervisor) share
//! state only through small JSON documents on disk. This crate makes that
//! coordination correct under concurrency and crash: atomic persistence,
//! hysteresis-stabilised health, dependency-ordered readiness, singleton
//! locking with stale-owner purge, idempotent action dedup, and bounded
//! auto-remediation.
//!
//! See `DESIGN.md` for the module map.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod clock;
pub mod config;
pub mod logging;

pub mod store;

pub mod freshness;
pub mod health;

pub mod orchestrator;
pub mod readiness;

pub mod idempotency;
pub mod lock;

pub mod ack;
pub mod heal;

pub mod coordinator;
