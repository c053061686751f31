//! Harness — model provider abstraction and reliability infrastructure for
//! the foreman agent runtime.
//!
//! This crate is the execution layer between agent orchestration and external
//! model providers. It coordinates:
//! - Provider abstraction for model calls (messages in, completion out)
//! - Retry with exponential backoff so transient provider failures never
//!   reach the agent loop as anything but a single collapsed error
//! - A script-backed provider for driving the system from external tooling
//!   and deterministic end-to-end tests

pub mod provider;
pub mod retry;
