//! Loading `stackconverge.yaml`.
//!
//! Precedence: environment overrides (`STACKCONVERGE_*`) beat the file; a
//! `.env` file next to the configuration is loaded first if present.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{ConfigError, Result};

use super::spec::StackConfig;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "STACKCONVERGE_";

/// Configuration file names searched for, in order.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "stackconverge.yaml",
    "stackconverge.yml",
    "stack.yaml",
    "stack.yml",
];

/// Loads and parses stack configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the directory holding `.env`.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or cannot be parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }
            .into());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ParseError {
            message: format!("Failed to read file: {e}"),
            location: Some(path.display().to_string()),
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from YAML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<StackConfig> {
        let config: StackConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = e
                .location()
                .map(|l| format!("line {}, column {}", l.line(), l.column()))
                .or_else(|| source.map(|p| p.display().to_string()));
            ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            }
        })?;

        debug!(
            "Parsed configuration for {} with {} resource(s)",
            config.project.name,
            config.resources.len()
        );
        Ok(config)
    }

    /// Loads `.env`, the file, then applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if `.env` or the file cannot be loaded.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        self.load_dotenv()?;
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config, |name| std::env::var(name).ok());
        Ok(config)
    }

    /// Applies `STACKCONVERGE_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(config: &mut StackConfig, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(&format!("{ENV_PREFIX}{key}"));

        if let Some(name) = var("PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            config.project.name = name;
        }
        if let Some(env) = var("PROJECT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            config.project.environment = env;
        }
        if let Some(url) = var("COMPUTE_URL") {
            debug!("Overriding provider.compute_url from environment");
            config.provider.compute_url = Some(url);
        }
        if let Some(url) = var("NETWORK_URL") {
            debug!("Overriding provider.network_url from environment");
            config.provider.network_url = Some(url);
        }
        if let Some(token_env) = var("TOKEN_ENV") {
            config.provider.token_env = token_env;
        }
        if let Some(secs) = var("REQUEST_TIMEOUT_SECS").and_then(|s| s.parse().ok()) {
            config.provider.request_timeout_secs = secs;
        }
        if let Some(path) = var("STATE_PATH") {
            debug!("Overriding state.path from environment");
            config.state.path = Some(path);
        }
    }

    /// Loads `.env` from the base path if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| ConfigError::ParseError {
                message: format!("Failed to load .env file: {e}"),
                location: Some(env_path.display().to_string()),
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }
        Ok(())
    }

    /// Reads the auth token from the variable named by the provider config.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is unset.
    pub fn token(config: &StackConfig) -> Result<String> {
        let name = &config.provider.token_env;
        std::env::var(name).map_err(|_| {
            ConfigError::MissingEnvVar {
                name: name.clone(),
            }
            .into()
        })
    }
}

/// Finds the configuration file in `start_dir` or its parents, then in the
/// user configuration directory.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        if let Some(found) = first_existing(&current) {
            return Ok(found);
        }
        if !current.pop() {
            break;
        }
    }

    if let Some(found) = dirs::config_dir()
        .map(|d| d.join("stackconverge"))
        .and_then(|d| first_existing(&d))
    {
        return Ok(found);
    }

    Err(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }
    .into())
}

fn first_existing(dir: &Path) -> Option<PathBuf> {
    DEFAULT_CONFIG_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.exists())
        .inspect(|path| info!("Found configuration file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConvergeError;
    use crate::lifecycle::ResizeTimeoutPolicy;
    use crate::schema::AttributeValue;
    use std::collections::HashMap;
    use tempfile::TempDir;

    const STACK: &str = r#"
project:
  name: web-stack
  environment: prod

provider:
  compute_url: https://compute.example.com/v2.1
  network_url: https://network.example.com
  resize_timeout_policy: revert
  conflict_retry:
    max_attempts: 5
    delay_secs: 1

resources:
  - name: net
    type: network
    attributes:
      name: private
  - name: web1
    type: compute
    attributes:
      name: web1
      image_ref: ubuntu-22.04
      flavor_ref: m1.small
      security_groups: [default, web]
    timeouts:
      create: 900
"#;

    #[test]
    fn test_parse_minimal() {
        let config = ConfigParser::new()
            .parse_yaml("project:\n  name: demo\n", None)
            .unwrap();
        assert_eq!(config.project.environment, "dev");
        assert!(config.resources.is_empty());
        assert!(!config.provider.simulate);
    }

    #[test]
    fn test_parse_full() {
        let config = ConfigParser::new().parse_yaml(STACK, None).unwrap();
        assert_eq!(config.resources.len(), 2);
        assert_eq!(config.provider.resize_timeout_policy, ResizeTimeoutPolicy::Revert);
        assert_eq!(config.provider.conflict_retry.unwrap().max_attempts, 5);

        let web = config.resource("web1").unwrap();
        assert_eq!(web.resource_type, "compute");
        assert_eq!(
            web.attributes.get("security_groups"),
            Some(&AttributeValue::strings(["default", "web"]))
        );
        assert_eq!(web.timeouts.unwrap().create, Some(900));
    }

    #[test]
    fn test_parse_error_has_location() {
        let err = ConfigParser::new()
            .parse_yaml("project: [unclosed", None)
            .unwrap_err();
        assert!(matches!(
            err,
            ConvergeError::Config(ConfigError::ParseError { location: Some(_), .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ConfigParser::new().parse_yaml(STACK, None).unwrap();
        let env: HashMap<&str, &str> = HashMap::from([
            ("STACKCONVERGE_PROJECT_ENVIRONMENT", "staging"),
            ("STACKCONVERGE_STATE_PATH", "/tmp/state.json"),
            ("STACKCONVERGE_REQUEST_TIMEOUT_SECS", "45"),
        ]);
        ConfigParser::apply_env_overrides(&mut config, |k| env.get(k).map(ToString::to_string));

        assert_eq!(config.project.environment, "staging");
        assert_eq!(config.state.path.as_deref(), Some("/tmp/state.json"));
        assert_eq!(config.provider.request_timeout_secs, 45);
        assert_eq!(config.project.name, "web-stack");
    }

    #[test]
    fn test_find_config_in_parent() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("stackconverge.yaml"), STACK).unwrap();
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, temp.path().join("stackconverge.yaml"));

        let config = ConfigParser::new().load_file(&found).unwrap();
        assert_eq!(config.project.name, "web-stack");
    }

    #[test]
    fn test_missing_file() {
        let err = ConfigParser::new()
            .load_file("/nonexistent/stackconverge.yaml")
            .unwrap_err();
        assert!(matches!(
            err,
            ConvergeError::Config(ConfigError::FileNotFound { .. })
        ));
    }
}
