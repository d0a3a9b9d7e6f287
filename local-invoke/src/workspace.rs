use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, instrument};

pub const INPUT_DIR: &str = "input";
pub const OUTPUT_DIR: &str = "output";
pub const METADATA_DIR: &str = ".metadata";
pub const CONFIG_DIR: &str = ".roboto";

pub const PARAMETERS_FILE: &str = "action_parameters.json";
pub const SECRETS_FILE: &str = "secrets.json";
pub const INPUTS_MANIFEST_FILE: &str = "action_inputs_manifest.json";
pub const METADATA_CHANGESET_FILE: &str = "dataset_metadata_changeset.json";

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Failed to clear workspace {path}: {source}")]
    Clear { path: PathBuf, source: io::Error },

    #[error("Failed to create workspace directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("Failed to create workspace file {path}: {source}")]
    CreateFile { path: PathBuf, source: io::Error },
}

/// The on-disk layout an action sees inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Describe the layout under `root` without touching the filesystem.
    pub fn layout(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Remove every entry under `root`. A missing root is not an error.
    #[instrument(skip_all, fields(root = %root.display()))]
    pub fn empty(root: &Path) -> Result<(), WorkspaceError> {
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(WorkspaceError::Clear {
                    path: root.to_path_buf(),
                    source,
                })
            }
        };

        for entry in entries {
            let entry = entry.map_err(|source| WorkspaceError::Clear {
                path: root.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            let is_dir = entry
                .file_type()
                .map(|t| t.is_dir())
                .map_err(|source| WorkspaceError::Clear {
                    path: path.clone(),
                    source,
                })?;
            let removed = if is_dir {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            removed.map_err(|source| WorkspaceError::Clear { path, source })?;
        }

        debug!("Workspace emptied");
        Ok(())
    }

    /// Create the directory tree and truncate the placeholder files.
    #[instrument(skip_all, fields(root = %root.display()))]
    pub fn setup(root: &Path) -> Result<Self, WorkspaceError> {
        create_dir(root)?;
        let root = root.canonicalize().map_err(|source| WorkspaceError::CreateDir {
            path: root.to_path_buf(),
            source,
        })?;
        let workspace = Self { root };

        for dir in [
            workspace.input_dir(),
            workspace.output_dir(),
            workspace.metadata_dir(),
            workspace.config_dir(),
        ] {
            create_dir(&dir)?;
        }

        for file in workspace.placeholder_files() {
            touch(&file)?;
        }

        debug!("Workspace ready");
        Ok(workspace)
    }

    /// Start every invocation from a clean slate.
    pub fn recreate(root: &Path) -> Result<Self, WorkspaceError> {
        Self::empty(root)?;
        Self::setup(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn input_dir(&self) -> PathBuf {
        self.root.join(INPUT_DIR)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join(OUTPUT_DIR)
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.output_dir().join(METADATA_DIR)
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join(CONFIG_DIR)
    }

    pub fn parameters_file(&self) -> PathBuf {
        self.config_dir().join(PARAMETERS_FILE)
    }

    pub fn secrets_file(&self) -> PathBuf {
        self.config_dir().join(SECRETS_FILE)
    }

    pub fn inputs_manifest_file(&self) -> PathBuf {
        self.input_dir().join(INPUTS_MANIFEST_FILE)
    }

    pub fn metadata_changeset_file(&self) -> PathBuf {
        self.metadata_dir().join(METADATA_CHANGESET_FILE)
    }

    fn placeholder_files(&self) -> [PathBuf; 4] {
        [
            self.parameters_file(),
            self.secrets_file(),
            self.inputs_manifest_file(),
            self.metadata_changeset_file(),
        ]
    }
}

fn create_dir(path: &Path) -> Result<(), WorkspaceError> {
    fs::create_dir_all(path).map_err(|source| WorkspaceError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

fn touch(path: &Path) -> Result<(), WorkspaceError> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map(|_| ())
        .map_err(|source| WorkspaceError::CreateFile {
            path: path.to_path_buf(),
            source,
        })
}
