pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, StepchainError};
pub use event::RunEvent;
pub use types::*;
