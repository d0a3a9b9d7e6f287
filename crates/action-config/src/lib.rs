//! Action descriptor loading.
//!
//! An action directory is marked by an `action.json` file that declares the
//! action's name, its parameter schema and whether it needs its inputs
//! downloaded before it starts. The descriptor is validated against an
//! embedded JSON schema before it is deserialized.

use jsonschema::{Draft, JSONSchema};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, instrument};

pub mod root;
pub use root::find_root_dir;

/// File name that marks the root of an action directory.
pub const ACTION_DESCRIPTOR: &str = "action.json";

const DESCRIPTOR_SCHEMA: &str = include_str!("../schema/action.v1.json");

static COMPILED_SCHEMA: OnceCell<JSONSchema> = OnceCell::new();

#[derive(Error, Debug)]
pub enum ActionConfigError {
    #[error("Could not find {marker} in {start} or any parent directory")]
    RootNotFound { marker: String, start: String },

    #[error("Could not find '{path}' file providing configuration for this action")]
    DescriptorNotFound { path: String },

    #[error("Schema compilation failed: {message}")]
    SchemaCompilationFailed { message: String },

    #[error("{path} failed validation:\n{}", format_validation_errors(.errors))]
    ValidationFailed {
        path: String,
        errors: Vec<ValidationError>,
    },

    #[error("JSON parsing failed for {path}: {message}")]
    JsonParsingFailed { path: String, message: String },

    #[error("Parameter '{name}' is declared more than once in {path}")]
    DuplicateParameter { path: String, name: String },

    #[error("The following parameter(s) are not defined in action.json: {}", .names.join(", "))]
    UnknownParameters { names: Vec<String> },

    #[error("IO error: {message}")]
    IoError { message: String },
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub json_pointer: String,
    pub message: String,
    pub schema_path: String,
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| {
            let pointer = if e.json_pointer.is_empty() {
                "/"
            } else {
                e.json_pointer.as_str()
            };
            format!("  {}: {}", pointer, e.message)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// A parameter declared by the action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionParameter {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default: Option<Value>,
}

/// Read-only view of `action.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Vec<ActionParameter>,
    #[serde(default)]
    pub requires_downloaded_inputs: Option<bool>,
    #[serde(default)]
    pub image_uri: Option<String>,
}

impl ActionConfig {
    /// Load the descriptor that lives directly in `root`.
    pub fn load_from_root(root: &Path) -> Result<Self, ActionConfigError> {
        Self::load(&descriptor_path(root))
    }

    #[instrument]
    pub fn load(path: &Path) -> Result<Self, ActionConfigError> {
        if !path.is_file() {
            return Err(ActionConfigError::DescriptorNotFound {
                path: path.display().to_string(),
            });
        }

        let content = fs::read_to_string(path).map_err(|e| ActionConfigError::IoError {
            message: format!("Failed to read {}: {}", path.display(), e),
        })?;

        Self::from_json_str(&content, path)
    }

    /// Parse and validate descriptor text. `origin` is only used in messages.
    pub fn from_json_str(content: &str, origin: &Path) -> Result<Self, ActionConfigError> {
        let origin_str = origin.display().to_string();
        let value: Value =
            serde_json::from_str(content).map_err(|e| ActionConfigError::JsonParsingFailed {
                path: origin_str.clone(),
                message: e.to_string(),
            })?;

        validate_descriptor(&origin_str, &value)?;

        let config: ActionConfig =
            serde_json::from_value(value).map_err(|e| ActionConfigError::JsonParsingFailed {
                path: origin_str.clone(),
                message: e.to_string(),
            })?;

        let mut seen = BTreeSet::new();
        for param in &config.parameters {
            if !seen.insert(param.name.as_str()) {
                return Err(ActionConfigError::DuplicateParameter {
                    path: origin_str,
                    name: param.name.clone(),
                });
            }
        }

        debug!(
            "Loaded action '{}' with {} declared parameter(s)",
            config.name,
            config.parameters.len()
        );
        Ok(config)
    }

    pub fn parameter(&self, name: &str) -> Option<&ActionParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn declared_parameter_names(&self) -> BTreeSet<&str> {
        self.parameters.iter().map(|p| p.name.as_str()).collect()
    }

    /// Supplied names that the descriptor does not declare, sorted.
    pub fn unknown_parameters<'a, I>(&self, provided: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let known = self.declared_parameter_names();
        let unknown: BTreeSet<&str> = provided
            .into_iter()
            .filter(|name| !known.contains(*name))
            .collect();
        unknown.into_iter().map(str::to_string).collect()
    }

    /// Fail if any supplied parameter name is not declared by the action.
    pub fn ensure_parameters_declared<'a, I>(&self, provided: I) -> Result<(), ActionConfigError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let names = self.unknown_parameters(provided);
        if names.is_empty() {
            Ok(())
        } else {
            Err(ActionConfigError::UnknownParameters { names })
        }
    }

    pub fn requires_downloaded_inputs(&self) -> bool {
        self.requires_downloaded_inputs.unwrap_or(false)
    }

    /// Image used for local runs when none is given on the command line.
    pub fn default_image(&self) -> String {
        match &self.image_uri {
            Some(uri) if !uri.trim().is_empty() => uri.clone(),
            _ => format!("{}:latest", self.name),
        }
    }
}

fn compiled_schema() -> Result<&'static JSONSchema, ActionConfigError> {
    COMPILED_SCHEMA.get_or_try_init(|| {
        let schema_value: Value = serde_json::from_str(DESCRIPTOR_SCHEMA).map_err(|e| {
            ActionConfigError::SchemaCompilationFailed {
                message: e.to_string(),
            }
        })?;

        JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&schema_value)
            .map_err(|e| ActionConfigError::SchemaCompilationFailed {
                message: e.to_string(),
            })
    })
}

fn validate_descriptor(origin: &str, value: &Value) -> Result<(), ActionConfigError> {
    let schema = compiled_schema()?;

    if let Err(errors) = schema.validate(value) {
        let validation_errors: Vec<ValidationError> = errors
            .map(|error| ValidationError {
                json_pointer: error.instance_path.to_string(),
                message: error.to_string(),
                schema_path: error.schema_path.to_string(),
            })
            .collect();

        return Err(ActionConfigError::ValidationFailed {
            path: origin.to_string(),
            errors: validation_errors,
        });
    }

    Ok(())
}

/// Location of the descriptor for an action rooted at `root`.
pub fn descriptor_path(root: &Path) -> PathBuf {
    root.join(ACTION_DESCRIPTOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn parse(value: Value) -> Result<ActionConfig, ActionConfigError> {
        ActionConfig::from_json_str(&value.to_string(), Path::new("action.json"))
    }

    #[test]
    fn test_load_descriptor_with_parameters() {
        let config = parse(json!({
            "name": "ingest-logs",
            "parameters": [
                { "name": "threshold", "required": true },
                { "name": "mode", "default": "fast", "description": "Processing mode" }
            ],
            "requires_downloaded_inputs": true
        }))
        .unwrap();

        assert_eq!(config.name, "ingest-logs");
        assert_eq!(config.parameters.len(), 2);
        assert!(config.parameters[0].required);
        assert_eq!(config.parameters[1].default, Some(json!("fast")));
        assert!(config.requires_downloaded_inputs());
    }

    #[test]
    fn test_unknown_fields_are_tolerated() {
        let config = parse(json!({
            "name": "a",
            "docker_config": { "dockerfile": "Dockerfile" },
            "tags": ["x"]
        }))
        .unwrap();
        assert!(config.parameters.is_empty());
        assert!(!config.requires_downloaded_inputs());
    }

    #[test]
    fn test_parameter_without_name_fails_schema() {
        let err = parse(json!({ "name": "a", "parameters": [{ "required": true }] })).unwrap_err();
        match err {
            ActionConfigError::ValidationFailed { errors, .. } => {
                assert!(errors.iter().any(|e| e.json_pointer == "/parameters/0"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_parameter_rejected() {
        let err = parse(json!({
            "name": "a",
            "parameters": [{ "name": "x" }, { "name": "x" }]
        }))
        .unwrap_err();
        assert!(matches!(err, ActionConfigError::DuplicateParameter { name, .. } if name == "x"));
    }

    #[test]
    fn test_unknown_parameters_sorted_and_deduplicated() {
        let config = parse(json!({ "name": "a", "parameters": [{ "name": "known" }] })).unwrap();
        let unknown = config.unknown_parameters(["zeta", "known", "alpha", "zeta"]);
        assert_eq!(unknown, vec!["alpha".to_string(), "zeta".to_string()]);

        let err = config
            .ensure_parameters_declared(["zeta", "alpha"])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "The following parameter(s) are not defined in action.json: alpha, zeta"
        );
        assert!(config.ensure_parameters_declared(["known"]).is_ok());
    }

    #[test]
    fn test_default_image() {
        let config = parse(json!({ "name": "my_action" })).unwrap();
        assert_eq!(config.default_image(), "my_action:latest");

        let config = parse(json!({ "name": "my_action", "image_uri": "registry/x:1.2" })).unwrap();
        assert_eq!(config.default_image(), "registry/x:1.2");
    }

    #[test]
    fn test_load_missing_descriptor() {
        let temp_dir = TempDir::new().unwrap();
        let err = ActionConfig::load_from_root(temp_dir.path()).unwrap_err();
        assert!(matches!(err, ActionConfigError::DescriptorNotFound { .. }));
    }

    #[test]
    fn test_load_invalid_json() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(descriptor_path(temp_dir.path()), "{ not json").unwrap();
        let err = ActionConfig::load_from_root(temp_dir.path()).unwrap_err();
        assert!(matches!(err, ActionConfigError::JsonParsingFailed { .. }));
    }
}
