//! `nodes` crate: the `TaskAction` trait, the run context, and the built-in
//! task variants.
//!
//! Every task (built-in and test double alike) must implement
//! [`TaskAction`].  The engine crate dispatches execution through this
//! trait object.

pub mod context;
pub mod error;
pub mod mock;
pub mod operators;
pub mod traits;
pub mod warehouse;

pub use context::RunContext;
pub use error::{ActionError, ConfigError, FailureKind, ProbeMismatch, TemplateError, WarehouseError};
pub use operators::{Collaborators, NoOp, OperatorConfig};
pub use traits::TaskAction;
