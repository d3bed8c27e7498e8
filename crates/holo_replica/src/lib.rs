//! Replica command-application crate.
//!
//! This crate applies the side effects of consensus-committed commands to a
//! single range replica. Higher layers hand it a `SideEffects` record (the
//! output of request evaluation, possibly merged from several partial
//! results) and it updates in-memory replica state, drives the store queues,
//! and verifies that durable and in-memory state never diverge.

pub mod config;
pub mod replica;
pub mod stopper;
pub mod storage;

pub use config::ApplyConfig;
pub use stopper::Stopper;
