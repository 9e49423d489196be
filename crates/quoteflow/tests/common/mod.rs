//! Shared test utilities for quoteflow integration tests.
//!
//! This module provides:
//! - `TestHarness` wiring an orchestrator over an in-memory database
//! - Scripted fakes for the agent, session, client-data and credential seams
//! - Builders for jobs, client data and recipes

pub mod builders;
pub mod fakes;
pub mod harness;

pub use builders::*;
pub use fakes::*;
pub use harness::TestHarness;
