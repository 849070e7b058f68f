//! # kakunin
//!
//! Work-session execution engine. Walks a worker through an ordered,
//! checkpointed step template, verifies each step against submitted
//! evidence (image plus audio/transcript) via an external multimodal
//! adapter, advances or holds progress on the verdict, and seals the
//! session into an immutable record on supervisor approval.
//!
//! Persistence is Postgres (sqlx); an in-memory store backs tests and
//! local development. Observability via tracing + OpenTelemetry.

pub mod adapters;
pub mod audit;
pub mod config;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod sequencer;
pub mod store;
pub mod telemetry;
