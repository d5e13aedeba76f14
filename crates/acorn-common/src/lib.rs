pub mod db;
pub mod error;
pub mod types;

pub use error::AcornError;
pub use types::*;
