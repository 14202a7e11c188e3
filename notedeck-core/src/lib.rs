pub mod errors;
pub mod filters;
pub mod library;
pub mod market;
pub mod models;
pub mod repo;
pub mod scheduler;
pub mod stats;

pub use errors::*;
pub use filters::*;
pub use models::*;
pub use repo::*;
pub use scheduler::*;
pub use stats::*;
