//! Shared test utilities for batchgen integration tests.
//!
//! This module provides:
//! - `TestHarness`: an orchestrator, reconciler and store over a temp database
//! - scripted fakes for the generation client, item queue and artifact sink

pub mod fakes;
pub mod harness;

pub use fakes::*;
pub use harness::TestHarness;
