//! One local invocation from validated arguments to the container's exit.

use crate::cli::InvocationArgs;
use crate::contract::{
    validate_parameters, ContractInputs, EnvironmentContract, PathTranslator,
    CONTAINER_CONFIG_FILE,
};
use crate::platform::{resolve_org_id, PlatformClient};
use crate::prepare::{InvocationPreparer, PreparationRequest};
use crate::workspace::Workspace;
use action_config::ActionConfig;
use anyhow::{anyhow, bail, Context, Result};
use container_launch::{BindMount, Cancellation, CleanupGuard, ContainerRun, Outcome};
use std::path::PathBuf;
use tracing::{debug, info, instrument, warn};

/// Collaborators and inputs of a single run.
pub struct Invocation<'a> {
    pub args: &'a InvocationArgs,
    pub action: &'a ActionConfig,
    pub platform: &'a dyn PlatformClient,
    pub preparer: &'a dyn InvocationPreparer,
    /// Host credentials file, mounted read-only into the container.
    pub credentials_file: Option<PathBuf>,
    pub cancellation: &'a Cancellation,
}

/// Run the invocation. Every failure aborts before the container starts;
/// the secrets file is removed on every path out of this function.
#[instrument(skip_all, fields(action = %invocation.action.name))]
pub fn run(invocation: Invocation<'_>) -> Result<Outcome> {
    let Invocation {
        args,
        action,
        platform,
        preparer,
        credentials_file,
        cancellation,
    } = invocation;

    validate_parameters(action, args.params())?;

    let org_id = resolve_org_id(args.org_id(), platform)?;

    let credentials_file = credentials_file
        .ok_or_else(|| anyhow!("Unable to locate the Roboto config file; set ROBOTO_CONFIG_FILE"))?;
    if !credentials_file.is_file() {
        bail!(
            "Roboto config file {} does not exist; it is mounted into the container at {}",
            credentials_file.display(),
            CONTAINER_CONFIG_FILE
        );
    }
    let credentials_file = credentials_file
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", credentials_file.display()))?;

    let workspace = Workspace::recreate(args.workspace_dir()).with_context(|| {
        format!(
            "Failed to set up workspace at {}",
            args.workspace_dir().display()
        )
    })?;
    let mut cleanup = CleanupGuard::new();
    cleanup.remove_on_drop(workspace.secrets_file());

    let input = args.invocation_input();
    preparer
        .prepare(&PreparationRequest {
            action,
            provided: args.params(),
            workspace: &workspace,
            input: input.as_ref(),
            org_id: &org_id,
        })
        .context("Failed to prepare invocation inputs")?;

    let hostname = hostname();
    let contract = EnvironmentContract::build(ContractInputs {
        args,
        workspace: &workspace,
        org_id: &org_id,
        endpoint: platform.endpoint(),
        hostname: &hostname,
    })?;

    let paths = PathTranslator::for_workspace(&workspace)?;
    let image = args
        .image()
        .map(str::to_string)
        .unwrap_or_else(|| action.default_image());

    let container = ContainerRun::new(image)
        .with_mount(BindMount::new(credentials_file, CONTAINER_CONFIG_FILE).readonly())
        .with_mount(BindMount::new(
            paths.host_root(),
            paths.container_root().display().to_string(),
        ))
        .with_env(contract.into_inner());

    info!("Running action {} ({})", action.name, container.image);
    let outcome = container.launch(cancellation, args.stop_timeout())?;
    match outcome {
        Outcome::Exited { code: 0 } => info!("Action completed"),
        Outcome::Exited { code } => warn!("Action exited with code {}", code),
        Outcome::Cancelled { signal } => warn!("Action cancelled by signal {}", signal),
    }

    Ok(outcome)
}

/// Host name reported in `ROBOTO_ENV`: the canonical name when the resolver
/// knows a qualified one, else the local host name.
pub fn hostname() -> String {
    let short = local_hostname();
    fully_qualified(&short)
}

fn local_hostname() -> String {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if rc == 0 {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            if let Ok(name) = std::str::from_utf8(&buf[..end]) {
                if !name.is_empty() {
                    return name.to_string();
                }
            }
        }
    }
    "localhost".to_string()
}

#[cfg(unix)]
fn fully_qualified(name: &str) -> String {
    use std::ffi::{CStr, CString};

    let Ok(node) = CString::new(name) else {
        return name.to_string();
    };
    let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
    hints.ai_family = libc::AF_UNSPEC;
    hints.ai_flags = libc::AI_CANONNAME;

    let mut found: *mut libc::addrinfo = std::ptr::null_mut();
    let rc = unsafe { libc::getaddrinfo(node.as_ptr(), std::ptr::null(), &hints, &mut found) };
    if rc != 0 || found.is_null() {
        debug!("Could not resolve canonical name of {}", name);
        return name.to_string();
    }

    let canonical = unsafe {
        let canon = (*found).ai_canonname;
        let value = (!canon.is_null())
            .then(|| CStr::from_ptr(canon).to_string_lossy().into_owned());
        libc::freeaddrinfo(found);
        value
    };
    match canonical {
        Some(fqdn) if fqdn.contains('.') => fqdn,
        _ => name.to_string(),
    }
}

#[cfg(not(unix))]
fn fully_qualified(name: &str) -> String {
    name.to_string()
}
