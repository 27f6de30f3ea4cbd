//! Subsystem seams. Implementations live in backend crates.

pub mod executor;
pub mod store;

pub use executor::{ExecutionContext, Executor};
pub use store::TaskStore;
