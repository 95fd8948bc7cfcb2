//! Command handlers: each consumes one parsed [`Command`] and produces the single
//! `<command>_res` response value the control client gets back.
//!
//! This is the one place in the daemon where a [`RegistryError`], a field-parse failure
//! or an exec failure gets mapped to a wire [`WireResult`] (§7's propagation policy).

use std::sync::Arc;

use gtp_dataplane::registry::TunnelParams;
use gtp_dataplane::wire::{
    Command, CreateTunReq, DestroyTunReq, StartProgramReq, StartProgramRes, WireEndpoint,
    WireResult, decode_hex, envelope,
};
use gtp_dataplane::{Registry, RegistryError};

use crate::control::ClientId;
use crate::supervisor::Supervisor;

/// Parses and dispatches one decoded control message, or builds the best-effort
/// `ERR_INVALID_DATA` response when decoding itself failed.
pub fn dispatch(
    registry: &Arc<Registry>,
    supervisor: &mut Supervisor,
    client: ClientId,
    value: serde_json::Value,
) -> serde_json::Value {
    let command = match Command::decode(value) {
        Ok(command) => command,
        Err(error) => return decode_error_response(&error),
    };

    match command {
        Command::CreateTun(req) => create_tun(registry, req),
        Command::DestroyTun(req) => destroy_tun(registry, req),
        Command::StartProgram(req) => start_program(registry, supervisor, client, req),
        Command::ResetAllState => reset_all_state(registry, supervisor),
    }
}

/// A decode-time failure has no successfully-parsed command name to key the response
/// under in the not-an-object / not-single-key cases; those get a synthetic `error_res`
/// key (see DESIGN.md Open Question resolution). A known-but-malformed body still keys
/// under its real `<command>_res` name, matching §4.4's contract.
fn decode_error_response(error: &gtp_dataplane::wire::DecodeError) -> serde_json::Value {
    use gtp_dataplane::wire::DecodeError;

    let key = match error {
        DecodeError::NotAnObject | DecodeError::NotSingleKey(_) => "error_res".to_owned(),
        DecodeError::UnknownCommand(cmd) => format!("{cmd}_res"),
        DecodeError::BadBody { command, .. } => format!("{command}_res"),
    };

    tracing::debug!(%error, "Rejecting control message");

    envelope(
        &key,
        gtp_dataplane::wire::SimpleResult {
            result: WireResult::ErrInvalidData,
        },
    )
}

fn create_tun(registry: &Arc<Registry>, req: CreateTunReq) -> serde_json::Value {
    let result = match parse_create_tun(req) {
        Ok(params) => match registry.tunnel_create(params) {
            Ok(()) => WireResult::Ok,
            // Legacy quirk preserved verbatim: allocation failure on `create_tun`
            // (including the duplicate-key case) reports `ERR_NOT_FOUND`, not
            // `ERR_INVALID_DATA`. See spec §9 Open Question / DESIGN.md.
            Err(_registry_error) => WireResult::ErrNotFound,
        },
        Err(()) => WireResult::ErrInvalidData,
    };

    envelope(
        "create_tun_res",
        gtp_dataplane::wire::SimpleResult { result },
    )
}

fn parse_create_tun(req: CreateTunReq) -> Result<TunnelParams, ()> {
    let local_bind_addr = req.local_gtp_ep.to_socket_addr().map_err(|_| ())?;
    let remote = req.remote_gtp_ep.to_socket_addr().map_err(|_| ())?;
    let user_addr = parse_user_addr(&req).map_err(|_| ())?;

    Ok(TunnelParams {
        local_bind_addr,
        remote,
        rx_teid: req.rx_teid,
        tx_teid: req.tx_teid,
        user_addr,
        tun_dev_name: req.tun_dev_name,
        tun_netns_name: req.tun_netns_name,
    })
}

fn parse_user_addr(req: &CreateTunReq) -> Result<std::net::IpAddr, ()> {
    use gtp_dataplane::wire::AddrType;

    let bytes = decode_hex(&req.user_addr).map_err(|_| ())?;

    match (req.user_addr_type, bytes.len()) {
        (AddrType::Ipv4, 4) => {
            let octets: [u8; 4] = bytes.try_into().expect("checked len == 4 above");
            Ok(std::net::Ipv4Addr::from(octets).into())
        }
        (AddrType::Ipv6, 16) => {
            let octets: [u8; 16] = bytes.try_into().expect("checked len == 16 above");
            Ok(std::net::Ipv6Addr::from(octets).into())
        }
        _ => Err(()),
    }
}

fn destroy_tun(registry: &Arc<Registry>, req: DestroyTunReq) -> serde_json::Value {
    let result = match req.local_gtp_ep.to_socket_addr() {
        Ok(bind_addr) => match registry.tunnel_destroy(bind_addr, req.rx_teid) {
            Ok(()) => WireResult::Ok,
            Err(RegistryError::NotFound) => WireResult::ErrNotFound,
            Err(_) => WireResult::ErrInvalidData,
        },
        Err(_) => WireResult::ErrInvalidData,
    };

    envelope(
        "destroy_tun_res",
        gtp_dataplane::wire::SimpleResult { result },
    )
}

fn start_program(
    registry: &Arc<Registry>,
    supervisor: &mut Supervisor,
    client: ClientId,
    req: StartProgramReq,
) -> serde_json::Value {
    if let Some(netns) = req.tun_netns_name.as_deref()
        && registry.find_tun_by_netns(netns).is_none()
    {
        return envelope(
            "start_program_res",
            StartProgramRes {
                result: WireResult::ErrInvalidData,
                pid: 0,
            },
        );
    }

    let environment = req.environment.unwrap_or_default();

    let res = match gtp_dataplane::process::spawn_in_namespace(
        &req.command,
        &req.run_as_user,
        &environment,
        req.tun_netns_name.as_deref(),
    ) {
        Ok(child) => {
            let pid = child.id() as i64;
            supervisor.register(child.id() as i32, client);
            StartProgramRes {
                result: WireResult::Ok,
                pid,
            }
        }
        Err(error) => {
            tracing::warn!(%error, "start_program failed");
            StartProgramRes {
                result: WireResult::ErrInvalidData,
                pid: 0,
            }
        }
    };

    envelope("start_program_res", res)
}

fn reset_all_state(registry: &Arc<Registry>, supervisor: &mut Supervisor) -> serde_json::Value {
    registry.reset_all();
    supervisor.kill_all();

    envelope(
        "reset_all_state_res",
        gtp_dataplane::wire::SimpleResult {
            result: WireResult::Ok,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use gtp_dataplane::wire::AddrType;

    fn local_ep(port: u16) -> WireEndpoint {
        WireEndpoint {
            addr_type: AddrType::Ipv4,
            ip: "7f000001".to_owned(),
            port,
        }
    }

    #[test]
    fn create_tun_rejects_bad_hex_with_invalid_data() {
        let registry = Arc::new(Registry::new());
        let req = CreateTunReq {
            tx_teid: 1,
            rx_teid: 2,
            user_addr_type: AddrType::Ipv4,
            user_addr: "zz".to_owned(),
            local_gtp_ep: local_ep(0),
            remote_gtp_ep: local_ep(9999),
            tun_dev_name: "tun0".to_owned(),
            tun_netns_name: None,
        };

        let res = create_tun(&registry, req);

        assert_eq!(res["create_tun_res"]["result"], "ERR_INVALID_DATA");
    }

    #[test]
    fn destroy_tun_on_missing_tunnel_is_not_found() {
        let registry = Arc::new(Registry::new());
        let req = DestroyTunReq {
            local_gtp_ep: local_ep(4268),
            rx_teid: 1,
        };

        let res = destroy_tun(&registry, req);

        assert_eq!(res["destroy_tun_res"]["result"], "ERR_NOT_FOUND");
    }

    #[test]
    fn start_program_rejects_unknown_namespace() {
        let registry = Arc::new(Registry::new());
        let mut supervisor = Supervisor::new();

        let req = StartProgramReq {
            command: "/bin/true".to_owned(),
            environment: None,
            run_as_user: "nobody".to_owned(),
            tun_netns_name: Some("no-such-ns".to_owned()),
        };

        let res = start_program(&registry, &mut supervisor, 1, req);

        assert_eq!(res["start_program_res"]["result"], "ERR_INVALID_DATA");
        assert_eq!(res["start_program_res"]["pid"], 0);
    }

    #[test]
    fn unknown_command_reports_invalid_data_under_its_own_key() {
        let value = serde_json::json!({"frobnicate": {}});

        let res = decode_error_response(&Command::decode(value).unwrap_err());

        assert_eq!(res["frobnicate_res"]["result"], "ERR_INVALID_DATA");
    }

    #[test]
    fn malformed_envelope_falls_back_to_error_res() {
        let value = serde_json::json!({"a": 1, "b": 2});

        let res = decode_error_response(&Command::decode(value).unwrap_err());

        assert_eq!(res["error_res"]["result"], "ERR_INVALID_DATA");
    }
}
