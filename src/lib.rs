//! Idempotent AWS infrastructure reconciler.
//!
//! Declares cloud resources as a dependency graph of typed specs and
//! converges reality toward it: probe first, create only what is missing,
//! adopt what already exists, and tear down in reverse order. Repeated
//! runs against an unchanged environment perform no mutations.

pub mod aws;
pub mod config;
pub mod error;
pub mod materialize;
pub mod orchestrator;
pub mod outcome;
pub mod output;
pub mod provider;
pub mod retry;
pub mod rules;
pub mod spec;
pub mod stack;
pub mod tags;
pub mod teardown;
pub mod testing;
pub mod wait;
