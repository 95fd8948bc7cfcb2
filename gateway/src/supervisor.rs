//! Child-process supervision: `start_program` bookkeeping plus the conversion of
//! asynchronous `SIGCHLD`/`SIGUSR1` delivery into synchronous events on the main loop.
//!
//! The subprocess table itself is touched only from the main thread (no lock, matching
//! §5's allocation thread-affinity rule); the signal thread never looks at it, it only
//! forwards parsed events.

use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::thread;

use nix::sys::signal::{SigSet, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use crate::control::ClientId;
use crate::eventloop::MainEvent;

/// A child process started on behalf of one control client, tracked until it is reaped.
pub struct Subprocess {
    pub client: ClientId,
}

/// The main-thread-only table of live subprocesses.
#[derive(Default)]
pub struct Supervisor {
    subprocesses: HashMap<i32, Subprocess>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pid: i32, client: ClientId) {
        self.subprocesses.insert(pid, Subprocess { client });
    }

    /// Looks up and removes the subprocess for a reaped `pid`, returning its owning
    /// client if it was still tracked (a foreign or already-forgotten pid is logged and
    /// discarded).
    pub fn child_terminated(&mut self, pid: i32) -> Option<ClientId> {
        self.subprocesses.remove(&pid).map(|sub| sub.client)
    }

    /// Sends `SIGKILL` to every subprocess owned by `client` and forgets them, used on
    /// transport close.
    pub fn kill_client(&mut self, client: ClientId) {
        let pids: Vec<i32> = self
            .subprocesses
            .iter()
            .filter(|(_, sub)| sub.client == client)
            .map(|(&pid, _)| pid)
            .collect();

        for pid in pids {
            kill(pid);
            self.subprocesses.remove(&pid);
        }
    }

    /// Sends `SIGKILL` to every tracked subprocess and forgets them, used by
    /// `reset_all_state`.
    pub fn kill_all(&mut self) {
        for &pid in self.subprocesses.keys() {
            kill(pid);
        }
        self.subprocesses.clear();
    }
}

fn kill(pid: i32) {
    if let Err(error) = nix::sys::signal::kill(Pid::from_raw(pid), Signal::SIGKILL) {
        tracing::debug!(pid, %error, "Failed to kill subprocess (likely already exited)");
    }
}

/// Blocks `SIGCHLD` and `SIGUSR1` process-wide.
///
/// Must be called on the main thread before any other thread is spawned: a thread's
/// signal mask is inherited from its creator at spawn time, and every worker thread in
/// this daemon must never observe these signals directly (§4.6, §9); only the dedicated
/// signal thread, via synchronous [`SigSet::wait`], consumes them.
pub fn block_signals() -> nix::Result<SigSet> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    mask.add(Signal::SIGUSR1);
    mask.thread_block()?;

    Ok(mask)
}

/// Spawns the dedicated thread that synchronously waits on `mask` and forwards parsed
/// events onto the main loop's channel.
///
/// `SIGCHLD` reaps every exited child in a `waitpid(-1, WNOHANG)` loop (more than one
/// child may have exited since the last wakeup) and emits one [`MainEvent::ChildReaped`]
/// per pid. `SIGUSR1` emits [`MainEvent::DumpDiagnostics`] for a diagnostic allocation
/// report; it carries no other payload.
pub fn spawn_signal_thread(mask: SigSet, tx: Sender<MainEvent>) {
    thread::Builder::new()
        .name("gtp-signals".to_owned())
        .spawn(move || signal_loop(mask, tx))
        .expect("spawning the signal thread should not fail under normal OS conditions");
}

fn signal_loop(mask: SigSet, tx: Sender<MainEvent>) {
    loop {
        let signal = match mask.wait() {
            Ok(signal) => signal,
            Err(error) => {
                tracing::error!(%error, "sigwait failed, signal thread exiting");
                return;
            }
        };

        match signal {
            Signal::SIGCHLD => reap_all(&tx),
            Signal::SIGUSR1 => {
                if tx.send(MainEvent::DumpDiagnostics).is_err() {
                    return;
                }
            }
            other => {
                tracing::debug!(?other, "Ignoring unexpected signal");
            }
        }
    }
}

fn reap_all(tx: &Sender<MainEvent>) {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => {
                if tx
                    .send(MainEvent::ChildReaped {
                        pid: pid.as_raw(),
                        exit_code: code,
                    })
                    .is_err()
                {
                    return;
                }
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                if tx
                    .send(MainEvent::ChildReaped {
                        pid: pid.as_raw(),
                        exit_code: -(sig as i32),
                    })
                    .is_err()
                {
                    return;
                }
            }
            Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::ECHILD) => return,
            Ok(_) => continue,
            Err(error) => {
                tracing::debug!(%error, "waitpid failed while reaping children");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_client_only_removes_that_clients_subprocesses() {
        let mut supervisor = Supervisor::new();
        supervisor.register(999_990, 1);
        supervisor.register(999_991, 2);

        supervisor.kill_client(1);

        assert!(supervisor.child_terminated(999_990).is_none());
        assert_eq!(supervisor.subprocesses.len(), 1);
    }

    #[test]
    fn child_terminated_returns_owning_client() {
        let mut supervisor = Supervisor::new();
        supervisor.register(999_992, 42);

        assert_eq!(supervisor.child_terminated(999_992), Some(42));
        assert_eq!(supervisor.child_terminated(999_992), None);
    }
}
