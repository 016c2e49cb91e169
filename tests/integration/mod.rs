//! Integration test suite for wavepilot.
//!
//! These tests run the whole engine against temporary git repositories and
//! a fake tool script, so no real tool or network access is needed.
//!
//! # Test Categories
//!
//! - `wave_execution`: end-to-end runs, dependency skips, working copies
//! - `concurrency`: gate bounds and wave ordering
//! - `failures`: timeouts, unusable output, spawn and isolation errors
//! - `reporting`: aggregation, persisted artifacts, config-driven runs

#![cfg(unix)]

mod fixtures;

mod concurrency;
mod failures;
