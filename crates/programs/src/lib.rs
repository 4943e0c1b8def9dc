//! Programs domain module.
//!
//! The Program aggregate (podcasts, shows), its write commands and the
//! denormalized document the search projection stores. Pure domain logic: no
//! IO, no storage.

pub mod document;
pub mod program;

pub use document::ProgramDocument;
pub use program::{AGGREGATE_TYPE, NewProgram, Program, ProgramChanges, program_event};
