//! Launches a single container through a docker-compatible runtime CLI and
//! supervises it until it exits or the operator cancels the run.

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub mod cancel;
pub mod cleanup;
mod supervise;

pub use cancel::Cancellation;
pub use cleanup::CleanupGuard;
pub use supervise::{supervise, Outcome};

/// Overrides the runtime binary (`docker` by default).
pub const RUNTIME_ENV: &str = "LOCAL_INVOKE_CONTAINER_RUNTIME";
/// Overrides the `uid:gid` the container runs as.
pub const USER_ENV: &str = "LOCAL_INVOKE_CONTAINER_USER";

const DEFAULT_RUNTIME: &str = "docker";

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Invalid container run: {message}")]
    InvalidConfig { message: String },
    #[error("Failed to spawn container runtime '{runtime}': {source}")]
    RuntimeSpawn {
        runtime: String,
        source: std::io::Error,
    },
    #[error("Failed while waiting for the container: {source}")]
    Wait { source: std::io::Error },
    #[error("Failed to stop the container: {source}")]
    Terminate { source: std::io::Error },
}

/// A host path bound into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: String,
    pub readonly: bool,
}

impl BindMount {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            readonly: false,
        }
    }

    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    fn as_arg(&self) -> String {
        format!(
            "type=bind,source={},target={},readonly={}",
            self.source.display(),
            self.target,
            self.readonly
        )
    }
}

/// Everything needed to assemble one `<runtime> run` invocation.
#[derive(Debug, Clone)]
pub struct ContainerRun {
    pub runtime: String,
    pub user: String,
    pub mounts: Vec<BindMount>,
    pub env: BTreeMap<String, String>,
    pub image: String,
    pub interactive: bool,
}

impl ContainerRun {
    /// Runtime and user come from the environment overrides or the host.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            runtime: detect_runtime(),
            user: container_user(),
            mounts: Vec::new(),
            env: BTreeMap::new(),
            image: image.into(),
            interactive: atty::is(atty::Stream::Stdin),
        }
    }

    pub fn with_mount(mut self, mount: BindMount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn validate(&self) -> Result<(), LaunchError> {
        if self.image.trim().is_empty() {
            return Err(invalid("Container image cannot be empty"));
        }

        if self.runtime.trim().is_empty() {
            return Err(invalid("Container runtime cannot be empty"));
        }

        for mount in &self.mounts {
            if !mount.source.is_absolute() {
                return Err(invalid(format!(
                    "Mount source '{}' must be an absolute path",
                    mount.source.display()
                )));
            }
            if !mount.source.exists() {
                return Err(invalid(format!(
                    "Mount source '{}' does not exist",
                    mount.source.display()
                )));
            }
            if !mount.target.starts_with('/') {
                return Err(invalid(format!(
                    "Mount target '{}' must be absolute",
                    mount.target
                )));
            }
        }

        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') {
                return Err(invalid(format!(
                    "Environment variable name '{}' is not valid",
                    key
                )));
            }
        }

        Ok(())
    }

    /// Build the runtime command without spawning it.
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.runtime);
        configure_command(&mut command, self);
        command
    }

    pub fn spawn(&self) -> Result<Child, LaunchError> {
        self.validate()?;
        let mut command = self.command();
        debug!("runtime command: {}", command_line_string(&command));

        command.spawn().map_err(|err| LaunchError::RuntimeSpawn {
            runtime: self.runtime.clone(),
            source: err,
        })
    }

    /// Spawn the container and block until it exits or `cancellation` fires.
    ///
    /// A run cancelled before it starts is never spawned.
    pub fn launch(
        &self,
        cancellation: &Cancellation,
        grace: Duration,
    ) -> Result<Outcome, LaunchError> {
        self.validate()?;

        if let Some(signal) = cancellation.received() {
            info!("Cancelled before the container started");
            return Ok(Outcome::Cancelled { signal });
        }

        let mut child = self.spawn()?;
        supervise(&mut child, cancellation, grace)
    }
}

fn invalid(message: impl Into<String>) -> LaunchError {
    LaunchError::InvalidConfig {
        message: message.into(),
    }
}

fn configure_command(command: &mut Command, run: &ContainerRun) {
    command.arg("run");
    command.arg("--rm");
    if run.interactive {
        command.arg("-it");
    }
    command.arg("-u").arg(&run.user);

    for mount in &run.mounts {
        command.arg("--mount").arg(mount.as_arg());
    }

    for (key, value) in &run.env {
        command.arg("-e").arg(format!("{}={}", key, value));
    }

    command.arg(&run.image);

    command.stdin(Stdio::inherit());
    command.stdout(Stdio::inherit());
    command.stderr(Stdio::inherit());
}

fn detect_runtime() -> String {
    match env::var(RUNTIME_ENV) {
        Ok(val) if !val.trim().is_empty() => val,
        _ => DEFAULT_RUNTIME.to_string(),
    }
}

/// `uid:gid` of this process so files written in the container stay owned
/// by the invoking user.
pub fn container_user() -> String {
    if let Ok(value) = env::var(USER_ENV) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    #[cfg(unix)]
    {
        let uid = unsafe { libc::geteuid() };
        let gid = unsafe { libc::getegid() };
        format!("{}:{}", uid, gid)
    }
    #[cfg(not(unix))]
    {
        "65534:65534".to_string()
    }
}

fn shell_escape(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    let escaped = arg.replace('\'', "'\\''");
    format!("'{}'", escaped)
}

/// Render a command for logs, quoting arguments that need it.
pub fn command_line_string(cmd: &Command) -> String {
    let mut s = String::new();
    s.push_str(&cmd.get_program().to_string_lossy());
    for a in cmd.get_args() {
        s.push(' ');
        let a = a.to_string_lossy();
        if a.is_empty() || a.contains(' ') || a.contains('"') || a.contains('\'') {
            s.push_str(&shell_escape(&a));
        } else {
            s.push_str(&a);
        }
    }
    s
}
