//! Core data model: read-only step templates and mutable work sessions.

pub mod session;
pub mod template;
