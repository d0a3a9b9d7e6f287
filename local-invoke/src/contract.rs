//! Environment variables handed to the action container.
//!
//! Hosted compute injects the same names; values here are rewritten so that
//! every path points into the container's mount namespace.

use crate::cli::InvocationArgs;
use crate::workspace::Workspace;
use action_config::{ActionConfig, ActionConfigError};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const DATASET_ID: &str = "ROBOTO_DATASET_ID";
pub const INPUT_DIR: &str = "ROBOTO_INPUT_DIR";
pub const OUTPUT_DIR: &str = "ROBOTO_OUTPUT_DIR";
pub const INVOCATION_ID: &str = "ROBOTO_INVOCATION_ID";
pub const ORG_ID: &str = "ROBOTO_ORG_ID";
pub const SERVICE_ENDPOINT: &str = "ROBOTO_SERVICE_ENDPOINT";
pub const RUNTIME_CONFIG_DIR: &str = "ROBOTO_ACTION_RUNTIME_CONFIG_DIR";
pub const INPUTS_MANIFEST: &str = "ROBOTO_ACTION_INPUTS_MANIFEST";
pub const PARAMETERS_FILE: &str = "ROBOTO_ACTION_PARAMETERS_FILE";
pub const METADATA_CHANGESET_FILE: &str = "ROBOTO_DATASET_METADATA_CHANGESET_FILE";
pub const ENV: &str = "ROBOTO_ENV";
pub const LOG_LEVEL: &str = "ROBOTO_LOG_LEVEL";
pub const DRY_RUN: &str = "ROBOTO_DRY_RUN";
pub const CONFIG_FILE: &str = "ROBOTO_CONFIG_FILE";
pub const HOME: &str = "HOME";

pub const PARAM_PREFIX: &str = "ROBOTO_PARAM_";

/// Invocation id reported for local runs; there is no platform record.
pub const LOCAL_INVOCATION_ID: &str = "inv_LOCAL_DOCKER_INVOCATION";
pub const UNSPECIFIED: &str = "N/A";
/// Where the host credentials file is mounted inside the container.
pub const CONTAINER_CONFIG_FILE: &str = "/roboto.config.json";

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("{path} is not inside workspace {root}")]
    OutsideWorkspace { path: PathBuf, root: PathBuf },

    #[error("Workspace root {root} has no usable directory name")]
    UnnamedWorkspace { root: PathBuf },

    #[error("Path {path} is not valid UTF-8")]
    NonUtf8Path { path: PathBuf },

    #[error(transparent)]
    Parameters(#[from] ActionConfigError),
}

pub fn parameter_env_key(name: &str) -> String {
    format!("{PARAM_PREFIX}{name}")
}

/// Every supplied parameter must be declared by the action.
pub fn validate_parameters(
    action: &ActionConfig,
    provided: &BTreeMap<String, String>,
) -> Result<(), ContractError> {
    action.ensure_parameters_declared(provided.keys().map(String::as_str))?;
    Ok(())
}

/// Rewrites host paths under the workspace root to container paths under
/// `/<workspace dir name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTranslator {
    host_root: PathBuf,
    container_root: PathBuf,
}

impl PathTranslator {
    pub fn for_workspace(workspace: &Workspace) -> Result<Self, ContractError> {
        let host_root = workspace.root().to_path_buf();
        let name = host_root
            .file_name()
            .ok_or_else(|| ContractError::UnnamedWorkspace {
                root: host_root.clone(),
            })?;
        let container_root = Path::new("/").join(name);
        Ok(Self {
            host_root,
            container_root,
        })
    }

    pub fn host_root(&self) -> &Path {
        &self.host_root
    }

    pub fn container_root(&self) -> &Path {
        &self.container_root
    }

    pub fn translate(&self, host_path: &Path) -> Result<PathBuf, ContractError> {
        let suffix =
            host_path
                .strip_prefix(&self.host_root)
                .map_err(|_| ContractError::OutsideWorkspace {
                    path: host_path.to_path_buf(),
                    root: self.host_root.clone(),
                })?;
        if suffix
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(ContractError::OutsideWorkspace {
                path: host_path.to_path_buf(),
                root: self.host_root.clone(),
            });
        }
        Ok(self.container_root.join(suffix))
    }

    fn translate_str(&self, host_path: &Path) -> Result<String, ContractError> {
        let translated = self.translate(host_path)?;
        translated
            .to_str()
            .map(str::to_string)
            .ok_or(ContractError::NonUtf8Path { path: translated })
    }
}

/// Everything the contract depends on besides the argument model.
#[derive(Debug, Clone, Copy)]
pub struct ContractInputs<'a> {
    pub args: &'a InvocationArgs,
    pub workspace: &'a Workspace,
    pub org_id: &'a str,
    pub endpoint: &'a str,
    pub hostname: &'a str,
}

/// Ordered env name to value map, built fresh for each invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentContract(BTreeMap<String, String>);

impl EnvironmentContract {
    pub fn build(inputs: ContractInputs<'_>) -> Result<Self, ContractError> {
        let ContractInputs {
            args,
            workspace,
            org_id,
            endpoint,
            hostname,
        } = inputs;
        let paths = PathTranslator::for_workspace(workspace)?;
        let container_root = paths
            .container_root()
            .to_str()
            .map(str::to_string)
            .ok_or_else(|| ContractError::NonUtf8Path {
                path: paths.container_root().to_path_buf(),
            })?;

        let mut env = BTreeMap::new();
        let mut set = |key: &str, value: String| {
            env.insert(key.to_string(), value);
        };

        set(DATASET_ID, args.dataset_id().unwrap_or(UNSPECIFIED).to_string());
        set(INPUT_DIR, paths.translate_str(&workspace.input_dir())?);
        set(OUTPUT_DIR, paths.translate_str(&workspace.output_dir())?);
        set(INVOCATION_ID, LOCAL_INVOCATION_ID.to_string());
        set(ORG_ID, org_id.to_string());
        set(SERVICE_ENDPOINT, endpoint.to_string());
        set(RUNTIME_CONFIG_DIR, paths.translate_str(&workspace.config_dir())?);
        set(
            INPUTS_MANIFEST,
            paths.translate_str(&workspace.inputs_manifest_file())?,
        );
        set(
            PARAMETERS_FILE,
            paths.translate_str(&workspace.parameters_file())?,
        );
        set(
            METADATA_CHANGESET_FILE,
            paths.translate_str(&workspace.metadata_changeset_file())?,
        );
        set(ENV, format!("LOCAL ({hostname})"));

        // Local-only knobs
        set(LOG_LEVEL, args.log_level().numeric().to_string());
        set(DRY_RUN, args.dry_run().to_string());
        set(CONFIG_FILE, CONTAINER_CONFIG_FILE.to_string());
        set(HOME, container_root);

        for (name, value) in args.params() {
            set(&parameter_env_key(name), value.clone());
        }

        debug!("Built environment contract with {} variable(s)", env.len());
        Ok(Self(env))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.0
    }
}
