//! Command-line argument model for local invocation.
//!
//! CLI customizations only affect local runs; hosted compute never sees
//! these flags, only the environment contract derived from them.

use action_config::ACTION_DESCRIPTOR;
use clap::{ArgAction, CommandFactory, Parser, ValueEnum};
use serde::Serialize;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::filter::LevelFilter;

/// Workspace directory created under the action root when `-w` is not given.
pub const DEFAULT_WORKSPACE_DIR: &str = ".workspace";

const QUERY_INPUT: &str = "Query-Based Input (mutually exclusive with dataset/file paths)";
const DATASET_INPUT: &str = "Dataset and File Path-Based Input (mutually exclusive with queries)";
const WORKSPACE_OPTIONS: &str = "Local Workspace Directory";
const GLOBAL_OPTIONS: &str = "Global Options";

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
}

impl LogLevel {
    /// One step towards `Debug`; `Debug` stays `Debug`.
    pub fn more_verbose(self) -> Self {
        match self {
            LogLevel::Error => LogLevel::Warning,
            LogLevel::Warning => LogLevel::Info,
            LogLevel::Info | LogLevel::Debug => LogLevel::Debug,
        }
    }

    /// Resolve `--log-level` and the number of `-v` flags into one level.
    ///
    /// Each `-v` lowers the level one step from `base`, which defaults to
    /// info. Extra `-v` past debug are ignored.
    pub fn from_flags(base: Option<LogLevel>, verbose: u8) -> Self {
        (0..verbose).fold(base.unwrap_or(LogLevel::Info), |level, _| {
            level.more_verbose()
        })
    }

    /// Numeric level understood by the action runtime inside the container.
    pub fn numeric(self) -> u8 {
        match self {
            LogLevel::Error => 40,
            LogLevel::Warning => 30,
            LogLevel::Info => 20,
            LogLevel::Debug => 10,
        }
    }

    pub fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Error => write!(f, "error"),
            LogLevel::Warning => write!(f, "warning"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Debug => write!(f, "debug"),
        }
    }
}

/// Data an invocation consumes, as handed to input preparation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InvocationInput {
    Query {
        file_query: Option<String>,
        topic_query: Option<String>,
    },
    DatasetFiles {
        dataset_id: String,
        file_paths: Vec<String>,
    },
}

#[derive(Debug, Error)]
pub enum ArgsError {
    #[error("No arguments supplied")]
    NoArguments { usage: String },

    #[error(transparent)]
    Clap(#[from] clap::Error),

    #[error("Failed to parse 'params': '{name}' was defined multiple times")]
    DuplicateParameter { name: String },

    #[error(
        "Cannot specify input data as both a query ({query}) and as a dataset/file paths combination ({dataset})"
    )]
    ConflictingInputModes { query: String, dataset: String },

    #[error(
        "Refusing to use {} as the workspace directory: emptying it would delete the action at {}",
        workspace.display(),
        action_root.display()
    )]
    WorkspaceContainsAction {
        workspace: PathBuf,
        action_root: PathBuf,
    },
}

#[derive(Parser, Debug)]
#[command(name = "local-invoke", version, about = "Invoke an action locally")]
struct Cli {
    /// Zero or more `<parameter_name>=<parameter_value>` pairs.
    /// `parameter_value` is parsed as a string.
    #[arg(
        short = 'p',
        long = "parameter",
        value_name = "NAME=VALUE",
        num_args = 1..,
        value_parser = parse_parameter
    )]
    params: Vec<(String, String)>,

    /// RoboQL query selecting input files
    #[arg(long, help_heading = QUERY_INPUT)]
    file_query: Option<String>,

    /// RoboQL query selecting input topics
    #[arg(long, help_heading = QUERY_INPUT)]
    topic_query: Option<String>,

    /// Dataset containing the input files
    #[arg(long, help_heading = DATASET_INPUT)]
    dataset_id: Option<String>,

    /// One or more file paths within the dataset
    #[arg(long, num_args = 1.., help_heading = DATASET_INPUT)]
    file_paths: Vec<String>,

    /// Local filesystem path to workspace directory. Default: <action root>/.workspace
    #[arg(short = 'w', long, value_name = "PATH", help_heading = WORKSPACE_OPTIONS)]
    workspace_dir: Option<PathBuf>,

    /// Roboto organization ID. Only necessary if you belong to multiple organizations.
    #[arg(long, help_heading = GLOBAL_OPTIONS)]
    org_id: Option<String>,

    /// Roboto profile to use. Must match a section within the Roboto config.json.
    #[arg(long, env = "ROBOTO_PROFILE", help_heading = GLOBAL_OPTIONS)]
    profile: Option<String>,

    /// Increase verbosity one level per occurrence, starting from --log-level.
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, help_heading = GLOBAL_OPTIONS)]
    verbose: u8,

    /// Set the logging level. Default: info.
    #[arg(long, value_enum, help_heading = GLOBAL_OPTIONS)]
    log_level: Option<LogLevel>,

    /// Use dry_run to gate side effects like modifying Roboto resources while testing locally.
    #[arg(short = 'd', long, help_heading = GLOBAL_OPTIONS)]
    dry_run: bool,

    /// Container image to run. Default: image_uri from action.json, else <action name>:latest
    #[arg(long, help_heading = GLOBAL_OPTIONS)]
    image: Option<String>,

    /// How long a cancelled container gets to stop before it is killed
    #[arg(
        long,
        value_name = "DURATION",
        value_parser = humantime::parse_duration,
        default_value = "10s",
        help_heading = GLOBAL_OPTIONS
    )]
    stop_timeout: Duration,
}

fn parse_parameter(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected <parameter_name>=<parameter_value>, got '{}'", raw))?;
    if name.trim().is_empty() {
        return Err(format!("parameter name is empty in '{}'", raw));
    }
    Ok((name.to_string(), value.to_string()))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// Validated, immutable arguments of one local invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationArgs {
    params: BTreeMap<String, String>,
    dry_run: bool,
    log_level: LogLevel,
    workspace_dir: PathBuf,
    dataset_id: Option<String>,
    file_paths: Option<Vec<String>>,
    file_query: Option<String>,
    topic_query: Option<String>,
    org_id: Option<String>,
    profile: Option<String>,
    image: Option<String>,
    stop_timeout: Duration,
}

impl InvocationArgs {
    /// Parse `tokens` (program name first). `action_root` anchors the default
    /// workspace directory.
    pub fn try_parse_from<I, T>(tokens: I, action_root: &Path) -> Result<Self, ArgsError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let tokens: Vec<OsString> = tokens.into_iter().map(Into::into).collect();
        if tokens.len() <= 1 {
            return Err(ArgsError::NoArguments { usage: usage() });
        }

        let cli = Cli::try_parse_from(tokens)?;
        Self::from_cli(cli, action_root)
    }

    fn from_cli(cli: Cli, action_root: &Path) -> Result<Self, ArgsError> {
        let mut params = BTreeMap::new();
        for (name, value) in cli.params {
            if params.contains_key(&name) {
                return Err(ArgsError::DuplicateParameter { name });
            }
            params.insert(name, value);
        }

        let file_paths = if cli.file_paths.is_empty() {
            None
        } else {
            Some(cli.file_paths)
        };

        let args = Self {
            params,
            dry_run: cli.dry_run,
            log_level: LogLevel::from_flags(cli.log_level, cli.verbose),
            workspace_dir: cli
                .workspace_dir
                .unwrap_or_else(|| action_root.join(DEFAULT_WORKSPACE_DIR)),
            dataset_id: non_empty(cli.dataset_id),
            file_paths,
            file_query: non_empty(cli.file_query),
            topic_query: non_empty(cli.topic_query),
            org_id: non_empty(cli.org_id),
            profile: non_empty(cli.profile),
            image: non_empty(cli.image),
            stop_timeout: cli.stop_timeout,
        };

        args.validate_input_constraints()?;
        args.validate_workspace_dir(action_root)?;
        Ok(args)
    }

    fn validate_input_constraints(&self) -> Result<(), ArgsError> {
        let mut query = Vec::new();
        if self.file_query.is_some() {
            query.push("--file-query");
        }
        if self.topic_query.is_some() {
            query.push("--topic-query");
        }

        let mut dataset = Vec::new();
        if self.dataset_id.is_some() {
            dataset.push("--dataset-id");
        }
        if self.file_paths.is_some() {
            dataset.push("--file-paths");
        }

        if !query.is_empty() && !dataset.is_empty() {
            return Err(ArgsError::ConflictingInputModes {
                query: query.join(", "),
                dataset: dataset.join(", "),
            });
        }

        Ok(())
    }

    /// The workspace is emptied on every run, so it must not hold the action
    /// itself. A directory that does not exist yet cannot.
    fn validate_workspace_dir(&self, action_root: &Path) -> Result<(), ArgsError> {
        let Ok(workspace) = self.workspace_dir.canonicalize() else {
            return Ok(());
        };
        let holds_action = workspace.join(ACTION_DESCRIPTOR).exists()
            || action_root
                .canonicalize()
                .map(|root| root.starts_with(&workspace))
                .unwrap_or(false);
        if holds_action {
            return Err(ArgsError::WorkspaceContainsAction {
                workspace,
                action_root: action_root.to_path_buf(),
            });
        }
        Ok(())
    }

    /// The selected input, if any selection mode was used.
    pub fn invocation_input(&self) -> Option<InvocationInput> {
        if self.file_query.is_some() || self.topic_query.is_some() {
            return Some(InvocationInput::Query {
                file_query: self.file_query.clone(),
                topic_query: self.topic_query.clone(),
            });
        }

        match (&self.dataset_id, &self.file_paths) {
            (Some(dataset_id), Some(file_paths)) => Some(InvocationInput::DatasetFiles {
                dataset_id: dataset_id.clone(),
                file_paths: file_paths.clone(),
            }),
            _ => None,
        }
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    pub fn dataset_id(&self) -> Option<&str> {
        self.dataset_id.as_deref()
    }

    pub fn file_paths(&self) -> Option<&[String]> {
        self.file_paths.as_deref()
    }

    pub fn file_query(&self) -> Option<&str> {
        self.file_query.as_deref()
    }

    pub fn topic_query(&self) -> Option<&str> {
        self.topic_query.as_deref()
    }

    pub fn org_id(&self) -> Option<&str> {
        self.org_id.as_deref()
    }

    pub fn profile(&self) -> Option<&str> {
        self.profile.as_deref()
    }

    pub fn image(&self) -> Option<&str> {
        self.image.as_deref()
    }

    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }
}

/// Rendered `--help` text.
pub fn usage() -> String {
    Cli::command().render_help().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<InvocationArgs, ArgsError> {
        let tokens = std::iter::once("local-invoke").chain(args.iter().copied());
        InvocationArgs::try_parse_from(tokens, Path::new("/actions/demo"))
    }

    #[test]
    fn no_arguments_is_an_error_with_usage() {
        let err = parse(&[]).unwrap_err();
        match err {
            ArgsError::NoArguments { usage } => assert!(usage.contains("--parameter")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn parameters_accumulate_across_flags() {
        let args = parse(&["-p", "a=1", "b=2", "--parameter", "c=x=y"]).unwrap();
        let expected: BTreeMap<String, String> = [("a", "1"), ("b", "2"), ("c", "x=y")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(args.params(), &expected);
    }

    #[test]
    fn duplicate_parameter_is_rejected() {
        let err = parse(&["--parameter", "a=1", "--parameter", "a=2"]).unwrap_err();
        assert!(matches!(err, ArgsError::DuplicateParameter { ref name } if name == "a"));
    }

    #[test]
    fn malformed_parameter_is_rejected() {
        assert!(matches!(
            parse(&["-p", "novalue"]).unwrap_err(),
            ArgsError::Clap(_)
        ));
        assert!(matches!(
            parse(&["-p", "=value"]).unwrap_err(),
            ArgsError::Clap(_)
        ));
    }

    #[test]
    fn repeated_parses_do_not_share_parameters() {
        let first = parse(&["-p", "a=1"]).unwrap();
        let second = parse(&["-p", "b=2"]).unwrap();
        assert_eq!(first.params().len(), 1);
        assert_eq!(second.params().len(), 1);
        assert!(second.params().contains_key("b"));
    }

    #[test]
    fn conflicting_input_modes_name_both_sides() {
        let err = parse(&["--file-query", "x", "--dataset-id", "ds_1"]).unwrap_err();
        match err {
            ArgsError::ConflictingInputModes { query, dataset } => {
                assert_eq!(query, "--file-query");
                assert_eq!(dataset, "--dataset-id");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = parse(&["--topic-query", "t", "--file-paths", "a.bag", "b.bag"]).unwrap_err();
        assert!(err.to_string().contains("--topic-query"));
        assert!(err.to_string().contains("--file-paths"));
    }

    #[test]
    fn no_selection_yields_no_input() {
        let args = parse(&["-d"]).unwrap();
        assert!(args.dry_run());
        assert_eq!(args.invocation_input(), None);
    }

    #[test]
    fn query_selection_yields_query_input() {
        let args = parse(&["--topic-query", "topic.name = 'imu'"]).unwrap();
        assert_eq!(
            args.invocation_input(),
            Some(InvocationInput::Query {
                file_query: None,
                topic_query: Some("topic.name = 'imu'".to_string()),
            })
        );
    }

    #[test]
    fn dataset_selection_yields_dataset_input() {
        let args = parse(&[
            "--dataset-id",
            "ds_1",
            "--file-paths",
            "a.bag",
            "--file-paths",
            "b.bag",
        ])
        .unwrap();
        assert_eq!(
            args.invocation_input(),
            Some(InvocationInput::DatasetFiles {
                dataset_id: "ds_1".to_string(),
                file_paths: vec!["a.bag".to_string(), "b.bag".to_string()],
            })
        );
    }

    #[test]
    fn dataset_without_paths_selects_nothing() {
        let args = parse(&["--dataset-id", "ds_1"]).unwrap();
        assert_eq!(args.dataset_id(), Some("ds_1"));
        assert_eq!(args.invocation_input(), None);
    }

    #[test]
    fn workspace_holding_the_action_is_refused() {
        let temp = tempfile::TempDir::new().unwrap();
        let action_root = temp.path().join("my_action");
        std::fs::create_dir_all(&action_root).unwrap();
        std::fs::write(action_root.join(ACTION_DESCRIPTOR), "{}").unwrap();

        for workspace in [action_root.clone(), temp.path().to_path_buf()] {
            let tokens = ["local-invoke", "-w", workspace.to_str().unwrap()];
            let err = InvocationArgs::try_parse_from(tokens, &action_root).unwrap_err();
            assert!(
                matches!(err, ArgsError::WorkspaceContainsAction { .. }),
                "{err:?}"
            );
        }

        let fresh = action_root.join(DEFAULT_WORKSPACE_DIR);
        let tokens = ["local-invoke", "-w", fresh.to_str().unwrap()];
        assert!(InvocationArgs::try_parse_from(tokens, &action_root).is_ok());
    }

    #[test]
    fn workspace_defaults_under_action_root() {
        let args = parse(&["-d"]).unwrap();
        assert_eq!(
            args.workspace_dir(),
            Path::new("/actions/demo").join(DEFAULT_WORKSPACE_DIR)
        );

        let args = parse(&["-w", "/tmp/ws"]).unwrap();
        assert_eq!(args.workspace_dir(), Path::new("/tmp/ws"));
    }

    #[test]
    fn default_log_level_is_info() {
        assert_eq!(parse(&["-d"]).unwrap().log_level(), LogLevel::Info);
        assert_eq!(
            parse(&["--log-level", "warning"]).unwrap().log_level(),
            LogLevel::Warning
        );
    }

    #[test]
    fn repeated_verbose_flags_step_down_and_floor() {
        let mut previous = parse(&["-d"]).unwrap().log_level();
        for count in 1..=6 {
            let flag = format!("-{}", "v".repeat(count));
            let level = parse(&["-d", flag.as_str()]).unwrap().log_level();
            assert!(level >= previous, "{flag} made logging quieter");
            previous = level;
        }
        assert_eq!(parse(&["-v"]).unwrap().log_level(), LogLevel::Debug);
        assert_eq!(parse(&["-vvvvv"]).unwrap().log_level(), LogLevel::Debug);
    }

    #[test]
    fn single_verbose_flag_is_never_quieter_than_default() {
        let default = parse(&["-d"]).unwrap().log_level();
        let verbose = parse(&["-d", "-v"]).unwrap().log_level();
        assert!(verbose.numeric() < default.numeric());
    }

    #[test]
    fn verbose_steps_down_from_error() {
        let level = |extra: &[&str]| {
            let mut argv = vec!["--log-level", "error"];
            argv.extend_from_slice(extra);
            parse(&argv).unwrap().log_level()
        };
        assert_eq!(level(&[]), LogLevel::Error);
        assert_eq!(level(&["-v"]), LogLevel::Warning);
        assert_eq!(level(&["-vv"]), LogLevel::Info);
        assert_eq!(level(&["-v", "-v", "-v"]), LogLevel::Debug);
    }

    #[test]
    fn verbose_steps_from_explicit_log_level() {
        let args = parse(&["--log-level", "warning", "-v"]).unwrap();
        assert_eq!(args.log_level(), LogLevel::Info);
    }

    #[test]
    fn numeric_levels() {
        assert_eq!(LogLevel::Error.numeric(), 40);
        assert_eq!(LogLevel::Warning.numeric(), 30);
        assert_eq!(LogLevel::Info.numeric(), 20);
        assert_eq!(LogLevel::Debug.numeric(), 10);
    }

    #[test]
    fn stop_timeout_parses_human_durations() {
        assert_eq!(
            parse(&["-d"]).unwrap().stop_timeout(),
            Duration::from_secs(10)
        );
        assert_eq!(
            parse(&["--stop-timeout", "1500ms"]).unwrap().stop_timeout(),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn identity_and_image_overrides() {
        let args = parse(&[
            "--org-id",
            "og_123",
            "--profile",
            "staging",
            "--image",
            "demo:dev",
        ])
        .unwrap();
        assert_eq!(args.org_id(), Some("og_123"));
        assert_eq!(args.profile(), Some("staging"));
        assert_eq!(args.image(), Some("demo:dev"));
    }
}
