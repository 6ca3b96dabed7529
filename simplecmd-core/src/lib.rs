pub mod error;
pub mod models;

pub use error::{Result, SimpleCmdError};
pub use models::*;
