pub mod schema;
pub mod error;
pub mod inventory;
pub mod runtime;
pub mod worker;
pub mod active;
pub mod analyze;

pub use schema::*;
pub use error::*;
pub use inventory::*;
pub use runtime::*;
pub use worker::{WorkerOptions, WorkerRuntime};
pub use active::*;
pub use analyze::*;
