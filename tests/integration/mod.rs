//! Integration test suite for cadre.
//!
//! These tests drive whole sessions through the public API: graph
//! readiness through the actor, coordinator runs with scripted workers and
//! approvers, checkpoint resume, gates and graph extension, the shell
//! worker, and the shutdown handshake.
//!
//! # Test Categories
//!
//! - `graph_scenarios`: Readiness and failure propagation through the graph actor
//! - `session_e2e`: Full coordinator runs
//! - `resume`: Checkpoint resume and idempotence
//! - `gates`: Approval gates and dynamic extension
//! - `shell`: The built-in shell worker
//! - `drain`: Shutdown handshake and force-close
//!
//! # CI Compatibility
//!
//! Workers are scripted in-process; the shell tests only need `sh`.

mod fixtures;

mod graph_scenarios;
mod session_e2e;
mod resume;
mod gates;
mod shell;
mod drain;
