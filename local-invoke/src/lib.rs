//! Local invocation of an action inside a container, using the same
//! workspace layout and environment contract as hosted compute.

pub mod cli;
pub mod contract;
pub mod logging;
pub mod orchestrator;
pub mod platform;
pub mod prepare;
pub mod workspace;

pub use cli::{ArgsError, InvocationArgs, InvocationInput, LogLevel};
pub use contract::EnvironmentContract;
pub use orchestrator::{run, Invocation};
pub use workspace::Workspace;
