//! Configuration validation.
//!
//! Provider settings are checked with `validator` derives; names, duplicate
//! resources, resource types and attribute schemas are checked by hand.

use std::collections::HashSet;
use tracing::debug;
use validator::{Validate, ValidationErrors};

use crate::error::{ConfigError, Result};
use crate::resources::{self, ResourceKind};

use super::spec::{ProjectConfig, ProviderConfig, ResourceConfig, StackConfig};

/// Everything found while validating.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Fatal problems.
    pub errors: Vec<ConfigError>,
    /// Non-fatal observations.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if there are no errors.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validates stack configurations against a set of resource kinds.
#[derive(Debug)]
pub struct ConfigValidator {
    kinds: Vec<ResourceKind>,
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigValidator {
    /// Creates a validator for the built-in resource kinds.
    #[must_use]
    pub fn new() -> Self {
        Self::with_kinds(resources::builtin())
    }

    /// Creates a validator for custom kinds.
    #[must_use]
    pub const fn with_kinds(kinds: Vec<ResourceKind>) -> Self {
        Self { kinds }
    }

    fn kind(&self, name: &str) -> Option<&ResourceKind> {
        self.kinds.iter().find(|k| k.name() == name)
    }

    /// Validates and fails on the first error.
    ///
    /// # Errors
    ///
    /// Returns the first error found.
    pub fn validate(&self, config: &StackConfig) -> Result<ValidationResult> {
        let mut result = self.check(config);
        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            Err(result.errors.swap_remove(0).into())
        }
    }

    /// Validates and collects every error and warning.
    #[must_use]
    pub fn check(&self, config: &StackConfig) -> ValidationResult {
        let mut result = ValidationResult::default();
        Self::check_project(&config.project, &mut result);
        Self::check_provider(&config.provider, &mut result);
        self.check_resources(config, &mut result);
        result
    }

    fn check_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result
                .errors
                .push(ConfigError::validation("Project name cannot be empty", "project.name"));
        } else if !is_valid_name(&project.name) {
            result.errors.push(ConfigError::validation(
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
                "project.name",
            ));
        }
        if project.environment.is_empty() {
            result.errors.push(ConfigError::validation(
                "Environment cannot be empty",
                "project.environment",
            ));
        }
    }

    fn check_provider(provider: &ProviderConfig, result: &mut ValidationResult) {
        if let Err(errors) = provider.validate() {
            result.errors.extend(flatten("provider", &errors));
        }
        if provider.simulate && (provider.compute_url.is_some() || provider.network_url.is_some())
        {
            result
                .warnings
                .push(String::from("provider.simulate is set; endpoints are ignored"));
        }
    }

    fn check_resources(&self, config: &StackConfig, result: &mut ValidationResult) {
        if config.resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources defined in configuration"));
            return;
        }

        let mut seen = HashSet::new();
        for (i, resource) in config.resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !seen.insert(resource.name.as_str()) {
                result.errors.push(ConfigError::DuplicateName {
                    name: resource.name.clone(),
                });
            }
            if !is_valid_name(&resource.name) {
                result.errors.push(ConfigError::validation(
                    format!(
                        "Resource name '{}' is invalid. Must be lowercase alphanumeric with hyphens or underscores.",
                        resource.name
                    ),
                    format!("{prefix}.name"),
                ));
            }

            self.check_resource(resource, &prefix, &config.provider, result);
        }
    }

    fn check_resource(
        &self,
        resource: &ResourceConfig,
        prefix: &str,
        provider: &ProviderConfig,
        result: &mut ValidationResult,
    ) {
        let Some(kind) = self.kind(&resource.resource_type) else {
            result.errors.push(ConfigError::UnknownResourceType {
                resource_type: resource.resource_type.clone(),
            });
            return;
        };

        if let Err(violation) = kind.validate(&resource.attributes) {
            result.errors.push(ConfigError::validation(
                violation.to_string(),
                format!("{prefix}.attributes"),
            ));
        }

        if let Some(timeouts) = &resource.timeouts {
            for (name, value) in [
                ("create", timeouts.create),
                ("update", timeouts.update),
                ("delete", timeouts.delete),
            ] {
                if value == Some(0) {
                    result.errors.push(ConfigError::validation(
                        "Timeout must be at least one second",
                        format!("{prefix}.timeouts.{name}"),
                    ));
                }
            }
        }

        if !provider.simulate
            && let Some(endpoint) = crate::gateway::RestEndpoint::builtin(kind.name())
            && provider.endpoint(&endpoint.service).is_none()
        {
            result.warnings.push(format!(
                "{prefix}: provider.{}_url is not set; {} cannot be reached",
                endpoint.service, resource.name
            ));
        }
    }
}

fn flatten(prefix: &str, errors: &ValidationErrors) -> Vec<ConfigError> {
    let mut flat: Vec<ConfigError> = errors
        .field_errors()
        .into_iter()
        .flat_map(|(field, list)| {
            list.iter().map(move |e| {
                let message = e
                    .message
                    .as_ref()
                    .map_or_else(|| format!("invalid value ({})", e.code), ToString::to_string);
                ConfigError::validation(message, format!("{prefix}.{field}"))
            })
        })
        .collect();

    for (field, kind) in errors.errors() {
        if let validator::ValidationErrorsKind::Struct(nested) = kind {
            flat.extend(flatten(&format!("{prefix}.{field}"), nested));
        }
    }
    flat.sort_by_key(ToString::to_string);
    flat
}

/// Lowercase alphanumerics, hyphens and underscores, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        && name.len() <= 63
}
