//! The main event loop: the single coordination point for every registry mutation,
//! subprocess bookkeeping change and response write (§4.8, §5).
//!
//! Every event that can cause main-thread work arrives here over one channel: parsed
//! control commands and connection lifecycle events from [`crate::control`], and reaped-
//! child / diagnostic-dump events from [`crate::supervisor`]'s signal thread. The loop
//! itself is a plain `for event in rx`, matching the distilled spec's description of an
//! allocator/mutator thread that never shares its state with anyone else.

use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::mpsc::Receiver;

use gtp_dataplane::Registry;
use gtp_dataplane::wire::{ProgramTermInd, envelope};

use crate::control::{ClientId, write_message};
use crate::handlers;
use crate::supervisor::Supervisor;

/// Every kind of event the main loop reacts to, regardless of source thread.
pub enum MainEvent {
    /// A new control connection was accepted; `stream` is the write half the main loop
    /// keeps for sending responses and unsolicited `program_term_ind`s to this client.
    ClientConnected { id: ClientId, stream: TcpStream },
    /// One complete control PDU was read from `id`'s connection.
    Command {
        id: ClientId,
        value: serde_json::Value,
    },
    /// `id`'s transport closed (cleanly or with an error).
    ClientDisconnected { id: ClientId },
    /// `SIGCHLD` reaped a child; `exit_code` is the exit status, or the negated signal
    /// number if the child was killed by a signal.
    ChildReaped { pid: i32, exit_code: i32 },
    /// `SIGUSR1` was delivered; dump a diagnostic allocation report.
    DumpDiagnostics,
}

pub struct Eventloop {
    registry: Arc<Registry>,
    supervisor: Supervisor,
    clients: HashMap<ClientId, TcpStream>,
    rx: Receiver<MainEvent>,
}

impl Eventloop {
    pub fn new(registry: Arc<Registry>, rx: Receiver<MainEvent>) -> Self {
        Self {
            registry,
            supervisor: Supervisor::new(),
            clients: HashMap::new(),
            rx,
        }
    }

    /// Runs until every sender of the main channel has been dropped (in practice, until
    /// the process is killed: the control acceptor thread holds a sender for the
    /// lifetime of the daemon).
    pub fn run(mut self) {
        while let Ok(event) = self.rx.recv() {
            self.handle(event);
        }
    }

    fn handle(&mut self, event: MainEvent) {
        match event {
            MainEvent::ClientConnected { id, stream } => {
                self.clients.insert(id, stream);
            }
            MainEvent::Command { id, value } => self.handle_command(id, value),
            MainEvent::ClientDisconnected { id } => {
                self.clients.remove(&id);
                self.supervisor.kill_client(id);
            }
            MainEvent::ChildReaped { pid, exit_code } => self.handle_child_reaped(pid, exit_code),
            MainEvent::DumpDiagnostics => {
                tracing::info!(
                    endpoints = self.registry.endpoint_count(),
                    tuns = self.registry.tun_count(),
                    tunnels = self.registry.tunnel_count(),
                    "Diagnostic report (SIGUSR1)"
                );
            }
        }
    }

    fn handle_command(&mut self, id: ClientId, value: serde_json::Value) {
        let response = handlers::dispatch(&self.registry, &mut self.supervisor, id, value);
        self.send(id, &response);
    }

    fn handle_child_reaped(&mut self, pid: i32, exit_code: i32) {
        let Some(client) = self.supervisor.child_terminated(pid) else {
            tracing::debug!(pid, "Reaped child with no tracked owner");
            return;
        };

        let indication = envelope(
            "program_term_ind",
            ProgramTermInd {
                pid: pid as i64,
                exit_code,
            },
        );

        self.send(client, &indication);
    }

    fn send(&mut self, id: ClientId, value: &serde_json::Value) {
        let Some(stream) = self.clients.get_mut(&id) else {
            tracing::debug!(id, "Dropping message for disconnected client");
            return;
        };

        if let Err(error) = write_message(stream, value) {
            tracing::warn!(id, %error, "Failed to write to control connection");
            self.clients.remove(&id);
            self.supervisor.kill_client(id);
        }
    }
}
