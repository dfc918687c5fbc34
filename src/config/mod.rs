//! Stack configuration.
//!
//! - Parsing `stackconverge.yaml` with `.env` and environment overrides
//! - Validation against the registered resource kinds
//! - Hashing for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, ENV_PREFIX, find_config_file};
pub use spec::{
    ConflictRetryConfig, ProjectConfig, ProviderConfig, ResourceConfig, StackConfig, StateConfig,
    TimeoutsConfig,
};
pub use validator::{ConfigValidator, ValidationResult};
