//! Built-in step types.

pub mod builtin;

pub use builtin::{builtin_registry, with_restraints, DispatchStep, FailStep, NoopStep};
