pub mod config;
pub mod coordinator;
pub mod dashboard;
pub mod error;
pub mod protocol;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

pub use error::{GridError, Result};
