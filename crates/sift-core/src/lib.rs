pub mod config;
pub mod error;
pub mod event;
pub mod mailbox;
pub mod structured;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, SiftError};
pub use event::EventBus;
pub use types::*;
