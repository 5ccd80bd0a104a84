//! Core domain types: identifiers, the job document, lifecycle states and
//! the start retry policy.

pub mod job;
pub mod retry;
pub mod state;
pub mod types;
