//! Fills the workspace files an action reads at startup.

use crate::cli::InvocationInput;
use crate::workspace::Workspace;
use action_config::ActionConfig;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, instrument, warn};

#[derive(Debug, Error)]
pub enum PrepareError {
    #[error("Missing value(s) for required parameter(s): {}", .names.join(", "))]
    MissingRequiredParameters { names: Vec<String> },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to serialize {path}: {source}")]
    Serialize {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Everything needed to stage one invocation's inputs.
#[derive(Debug, Clone, Copy)]
pub struct PreparationRequest<'a> {
    pub action: &'a ActionConfig,
    pub provided: &'a BTreeMap<String, String>,
    pub workspace: &'a Workspace,
    pub input: Option<&'a InvocationInput>,
    pub org_id: &'a str,
}

pub trait InvocationPreparer {
    fn prepare(&self, request: &PreparationRequest<'_>) -> Result<(), PrepareError>;
}

/// Input manifest written for the action. Files are never downloaded
/// locally, so `files` stays empty.
#[derive(Debug, Serialize)]
struct InputsManifest<'a> {
    selector: Option<&'a InvocationInput>,
    requires_downloaded_inputs: bool,
    files: Vec<String>,
}

/// Stages parameters, secrets and the input manifest on the local disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalPreparer;

impl LocalPreparer {
    pub fn new() -> Self {
        Self
    }
}

impl InvocationPreparer for LocalPreparer {
    #[instrument(skip_all, fields(action = %request.action.name, org_id = request.org_id))]
    fn prepare(&self, request: &PreparationRequest<'_>) -> Result<(), PrepareError> {
        let values = parameter_values(request.action, request.provided)?;
        write_json(&request.workspace.parameters_file(), &values)?;

        write_json(&request.workspace.secrets_file(), &Map::new())?;

        let requires_downloaded_inputs = request.action.requires_downloaded_inputs();
        if requires_downloaded_inputs && request.input.is_some() {
            warn!(
                "Action requires downloaded inputs; they are not fetched for local runs. \
                 Place input files in {} manually.",
                request.workspace.input_dir().display()
            );
        }
        let manifest = InputsManifest {
            selector: request.input,
            requires_downloaded_inputs,
            files: Vec::new(),
        };
        write_json(&request.workspace.inputs_manifest_file(), &manifest)?;

        debug!("Prepared {} parameter value(s)", values.len());
        Ok(())
    }
}

/// Declared defaults overlaid with supplied values.
pub fn parameter_values(
    action: &ActionConfig,
    provided: &BTreeMap<String, String>,
) -> Result<Map<String, Value>, PrepareError> {
    let mut values = Map::new();
    let mut missing = Vec::new();

    for param in &action.parameters {
        match (provided.get(&param.name), &param.default) {
            (Some(value), _) => {
                values.insert(param.name.clone(), Value::String(value.clone()));
            }
            (None, Some(default)) => {
                values.insert(param.name.clone(), default.clone());
            }
            (None, None) if param.required => missing.push(param.name.clone()),
            (None, None) => {}
        }
    }

    if !missing.is_empty() {
        missing.sort();
        return Err(PrepareError::MissingRequiredParameters { names: missing });
    }

    Ok(values)
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), PrepareError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| PrepareError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, bytes).map_err(|source| PrepareError::Write {
        path: path.to_path_buf(),
        source,
    })
}
