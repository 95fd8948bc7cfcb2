//! Child-process spawning for `start_program`: namespace entry, privilege drop and
//! environment filtering, all in one scoped operation on the main thread.
//!
//! Like [`crate::netns::enter`], this must only ever run on the daemon's single main
//! thread: it mutates process-wide kernel state (the calling thread's namespace, briefly)
//! around the `fork`.

use std::os::unix::process::CommandExt as _;
use std::process::{Child, Command};

use nix::unistd::{Gid, Uid, User};

/// Environment variable names always passed through to a spawned program, regardless of
/// what the control client requested.
///
/// Keeps child processes from inheriting the daemon's full environment (credentials,
/// internal state) while still giving them a usable shell environment.
const ENV_WHITELIST: &[&str] = &["PATH", "HOME", "LANG", "TERM", "USER"];

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to enter network namespace {0:?}")]
    Namespace(String, #[source] std::io::Error),
    #[error("unknown user {0:?}")]
    UnknownUser(String),
    #[error("failed to resolve user {0:?}")]
    LookupUser(String, #[source] nix::Error),
    #[error("failed to spawn {0:?}")]
    Spawn(String, #[source] std::io::Error),
}

/// Splits `command` into a program and its arguments the way a shell would, without
/// invoking a shell.
fn split_command(command: &str) -> Option<(&str, Vec<&str>)> {
    let mut parts = command.split_whitespace();
    let program = parts.next()?;

    Some((program, parts.collect()))
}

/// Starts `command` as `run_as_user`, with `environment` appended to [`ENV_WHITELIST`],
/// optionally inside the network namespace owning `tun_netns_name`.
///
/// On success, the child has already been `exec`'d; the returned [`Child`] is reaped by
/// the caller's `SIGCHLD` handling, not by `wait`ing here.
pub fn spawn_in_namespace(
    command: &str,
    run_as_user: &str,
    environment: &[String],
    netns_name: Option<&str>,
) -> Result<Child, SpawnError> {
    let (program, args) = split_command(command)
        .ok_or_else(|| SpawnError::Spawn(command.to_owned(), std::io::Error::other("empty command")))?;

    let user = User::from_name(run_as_user)
        .map_err(|e| SpawnError::LookupUser(run_as_user.to_owned(), e))?
        .ok_or_else(|| SpawnError::UnknownUser(run_as_user.to_owned()))?;

    let netns_file = netns_name
        .map(crate::netns::open)
        .transpose()
        .map_err(|e| SpawnError::Namespace(netns_name.unwrap_or_default().to_owned(), e))?;

    let mut cmd = Command::new(program);
    cmd.args(&args);
    cmd.env_clear();

    for name in ENV_WHITELIST {
        if let Ok(value) = std::env::var(name) {
            cmd.env(name, value);
        }
    }
    for entry in environment {
        if let Some((key, value)) = entry.split_once('=') {
            cmd.env(key, value);
        }
    }

    let uid = user.uid;
    let gid = user.gid;

    // Safety: only async-signal-safe calls (`setns`, `setgid`, `setuid`) between `fork`
    // and `exec`, matching the contract of `pre_exec`.
    unsafe {
        cmd.pre_exec(move || {
            if let Some(ref file) = netns_file {
                set_child_namespace(file)?;
            }
            drop_privileges(uid, gid)?;
            Ok(())
        });
    }

    cmd.spawn()
        .map_err(|e| SpawnError::Spawn(command.to_owned(), e))
}

fn set_child_namespace(file: &std::fs::File) -> std::io::Result<()> {
    use std::os::fd::AsFd as _;
    nix::sched::setns(file.as_fd(), nix::sched::CloneFlags::CLONE_NEWNET)
        .map_err(std::io::Error::from)
}

fn drop_privileges(uid: Uid, gid: Gid) -> std::io::Result<()> {
    nix::unistd::setgid(gid).map_err(std::io::Error::from)?;
    nix::unistd::setuid(uid).map_err(std::io::Error::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_simple_command() {
        let (program, args) = split_command("/bin/true").unwrap();
        assert_eq!(program, "/bin/true");
        assert!(args.is_empty());
    }

    #[test]
    fn splits_command_with_args() {
        let (program, args) = split_command("/bin/echo hello world").unwrap();
        assert_eq!(program, "/bin/echo");
        assert_eq!(args, vec!["hello", "world"]);
    }

    #[test]
    fn rejects_empty_command() {
        assert!(split_command("   ").is_none());
    }
}
