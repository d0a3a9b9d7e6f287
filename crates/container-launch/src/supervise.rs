use crate::{Cancellation, LaunchError};
use std::process::{Child, ExitStatus};
use std::time::Duration;
use tracing::{info, warn};
use wait_timeout::ChildExt;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How a supervised container run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The runtime process exited on its own.
    Exited { code: i32 },
    /// The operator cancelled the run with `signal`.
    Cancelled { signal: i32 },
}

impl Outcome {
    /// Exit status this process should report for the outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Exited { code } => *code,
            Outcome::Cancelled { signal } => 128 + signal,
        }
    }
}

/// Block until `child` exits, or until `cancellation` fires.
///
/// On cancellation the child gets SIGTERM, then SIGKILL if it is still
/// running after `grace`; it is always reaped before returning.
pub fn supervise(
    child: &mut Child,
    cancellation: &Cancellation,
    grace: Duration,
) -> Result<Outcome, LaunchError> {
    loop {
        if let Some(signal) = cancellation.received() {
            info!("Received signal {}, stopping container", signal);
            terminate(child, grace)?;
            return Ok(Outcome::Cancelled { signal });
        }

        match child.wait_timeout(POLL_INTERVAL) {
            Ok(Some(status)) => {
                return Ok(Outcome::Exited {
                    code: exit_code(&status),
                })
            }
            Ok(None) => continue,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(LaunchError::Wait { source: err }),
        }
    }
}

fn terminate(child: &mut Child, grace: Duration) -> Result<(), LaunchError> {
    request_stop(child);

    match child.wait_timeout(grace) {
        Ok(Some(_)) => return Ok(()),
        Ok(None) => warn!(
            "Container did not stop within {:?}, killing it",
            grace
        ),
        Err(err) => warn!("Waiting for container to stop failed: {}", err),
    }

    if let Err(err) = child.kill() {
        // Already exited between the wait and the kill.
        if err.kind() != std::io::ErrorKind::InvalidInput {
            return Err(LaunchError::Terminate { source: err });
        }
    }
    child
        .wait()
        .map(|_| ())
        .map_err(|err| LaunchError::Terminate { source: err })
}

#[cfg(unix)]
fn request_stop(child: &Child) {
    let pid = child.id() as libc::pid_t;
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        warn!(
            "Failed to send SIGTERM to container runtime (pid {}): {}",
            pid,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn request_stop(_child: &Child) {}

fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_exit_codes() {
        assert_eq!(Outcome::Exited { code: 0 }.exit_code(), 0);
        assert_eq!(Outcome::Exited { code: 3 }.exit_code(), 3);
        assert_eq!(Outcome::Cancelled { signal: 2 }.exit_code(), 130);
        assert_eq!(Outcome::Cancelled { signal: 15 }.exit_code(), 143);
    }
}
