pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::{AppConfig, BackoffStrategy, EngineConfig, RetryPolicy};
pub use error::{FlowError, NodeError, NodeErrorKind, NodeResult, Result, RunFailure, ValidationError};
pub use event::EventBus;
pub use traits::{HandlerOutput, NodeHandler, RunStore};
pub use types::*;
