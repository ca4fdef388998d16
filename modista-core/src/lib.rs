//! # modista-core
//!
//! Configuration, error types, persistence helpers and logging shared by the
//! Modista training crates.

pub mod config;
pub mod error;
pub mod logging;
pub mod paths;
pub mod persistence;

pub use config::{TrainConfig, load_config};
pub use error::{ConfigError, CoreError};
pub use logging::{RunLog, init_tracing};
pub use paths::{RunPaths, model_identifier};
