//! Agents — the model-driven roles of the foreman orchestrator.
//!
//! A PM agent decomposes a project description into a structured plan; SWE
//! agents implement one task each inside an isolated working copy. Both run
//! the same iteration loop: build context, call the model, parse the reply
//! into directives, apply them, feed observations back. The directive
//! grammar is strict; anything the parser rejects is returned to the model
//! verbatim instead of being guessed at.

pub mod directive;
pub mod history;
pub mod roles;
pub mod runtime;
pub mod verify;
