use action_config::{find_root_dir, ActionConfig, ACTION_DESCRIPTOR};
use anyhow::{Context, Result};
use container_launch::Cancellation;
use local_invoke::platform::{credentials_file, Credentials, ProfileClient};
use local_invoke::prepare::LocalPreparer;
use local_invoke::{logging, orchestrator, ArgsError, Invocation, InvocationArgs};
use std::env;
use std::path::PathBuf;

fn main() {
    // Exit only after `run` returns so its cleanup guards have dropped.
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            1
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let action_root = locate_action_root()?;
    let action = ActionConfig::load_from_root(&action_root)?;

    let args = match InvocationArgs::try_parse_from(env::args_os(), &action_root) {
        Ok(args) => args,
        Err(ArgsError::NoArguments { usage }) => {
            eprintln!("{}", usage);
            return Ok(1);
        }
        Err(ArgsError::Clap(err)) => {
            let _ = err.print();
            return Ok(if err.use_stderr() { 1 } else { 0 });
        }
        Err(err) => return Err(err.into()),
    };

    logging::init(args.log_level());
    let cancellation = Cancellation::install();

    let credentials_file = credentials_file();
    let credentials = Credentials::resolve(args.profile(), credentials_file.as_deref())
        .context("Failed to resolve Roboto credentials")?;
    let platform = ProfileClient::new(credentials)?;
    let preparer = LocalPreparer::new();

    let outcome = orchestrator::run(Invocation {
        args: &args,
        action: &action,
        platform: &platform,
        preparer: &preparer,
        credentials_file,
        cancellation: &cancellation,
    })?;

    Ok(outcome.exit_code())
}

/// Nearest ancestor of the executable holding `action.json`, else the
/// nearest ancestor of the working directory.
fn locate_action_root() -> Result<PathBuf> {
    let from_exe = env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(PathBuf::from))
        .and_then(|dir| find_root_dir(&dir, ACTION_DESCRIPTOR).ok());
    if let Some(root) = from_exe {
        return Ok(root);
    }

    let cwd = env::current_dir().context("Failed to read the current directory")?;
    Ok(find_root_dir(&cwd, ACTION_DESCRIPTOR)?)
}
