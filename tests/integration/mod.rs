//! Integration test suite for cadence.
//!
//! These tests drive the scheduler, worker pool, cleanup passes and the
//! pipeline coordinator together against a temporary cadence home.
//!
//! # Test Categories
//!
//! - `scheduling`: Wave composition and ownership separation
//! - `recovery`: Staleness release and orphan reclamation
//! - `resume`: Checkpointed sessions, crashes and resume
//! - `convergence`: Repair-then-rescore halting rules
//! - `properties`: Property tests over generated plans
//!
//! # CI Compatibility
//!
//! Workers are in-process executors; no external commands are spawned.
//! Time-dependent tests run with the tokio clock paused.

mod fixtures;

mod convergence;
mod properties;
mod recovery;
mod resume;
mod scheduling;
