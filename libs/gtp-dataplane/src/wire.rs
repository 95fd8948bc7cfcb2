//! Wire formats: the GTP1-U header for the data plane and the JSON command PDUs for the
//! control channel.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Fixed size of a GTP1-U header carrying no sequence number or extension headers.
pub const GTP1_HEADER_LEN: usize = 8;

const FLAGS_V1_GTP: u8 = 0x30;
const MESSAGE_TYPE_TPDU: u8 = 0xFF;

/// A decoded GTP1-U header, as found on every T-PDU this daemon accepts or emits.
///
/// No sequence number, N-PDU number or extension header is ever generated or accepted;
/// `flags` is always `0x30` and `message_type` is always `0xFF` (T-PDU).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gtp1Header {
    pub length: u16,
    pub teid: u32,
}

/// Why a received datagram was not a valid, acceptable GTP1-U T-PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("datagram shorter than a GTP1-U header ({0} bytes)")]
    TooShort(usize),
    #[error("unexpected flags byte {0:#04x}, expected 0x30")]
    UnexpectedFlags(u8),
    #[error("unexpected message type {0:#04x}, expected 0xff (T-PDU)")]
    UnexpectedMessageType(u8),
    #[error("header.length ({length}) + header exceeds received bytes ({received})")]
    LengthExceedsDatagram { length: u16, received: usize },
}

impl Gtp1Header {
    /// Parses and validates a GTP1-U header from the front of `datagram`.
    ///
    /// On success, the returned header's `length` field is guaranteed to fit within
    /// `datagram`, i.e. `datagram[GTP1_HEADER_LEN..][..length]` is a valid slice.
    pub fn decode(datagram: &[u8]) -> Result<Self, HeaderError> {
        if datagram.len() < GTP1_HEADER_LEN {
            return Err(HeaderError::TooShort(datagram.len()));
        }

        let flags = datagram[0];
        if flags != FLAGS_V1_GTP {
            return Err(HeaderError::UnexpectedFlags(flags));
        }

        let message_type = datagram[1];
        if message_type != MESSAGE_TYPE_TPDU {
            return Err(HeaderError::UnexpectedMessageType(message_type));
        }

        let length = u16::from_be_bytes([datagram[2], datagram[3]]);
        let teid = u32::from_be_bytes([datagram[4], datagram[5], datagram[6], datagram[7]]);

        if GTP1_HEADER_LEN + length as usize > datagram.len() {
            return Err(HeaderError::LengthExceedsDatagram {
                length,
                received: datagram.len(),
            });
        }

        Ok(Self { length, teid })
    }

    /// Writes an 8-byte GTP1-U header for a T-PDU of `payload_len` bytes carrying `teid`
    /// into the first [`GTP1_HEADER_LEN`] bytes of `out`.
    pub fn encode(out: &mut [u8; GTP1_HEADER_LEN], payload_len: u16, teid: u32) {
        out[0] = FLAGS_V1_GTP;
        out[1] = MESSAGE_TYPE_TPDU;
        out[2..4].copy_from_slice(&payload_len.to_be_bytes());
        out[4..8].copy_from_slice(&teid.to_be_bytes());
    }
}

/// Decodes a hex string into raw bytes, rejecting odd lengths and non-hex characters.
pub fn decode_hex(s: &str) -> Result<Vec<u8>, HexError> {
    if s.len() % 2 != 0 {
        return Err(HexError::OddLength);
    }

    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| HexError::InvalidDigit))
        .collect()
}

/// Encodes raw bytes as a lowercase hex string.
pub fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HexError {
    #[error("hex string has odd length")]
    OddLength,
    #[error("hex string contains a non-hex digit")]
    InvalidDigit,
}

/// `IPV4` | `IPV6`, as spelled on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddrType {
    #[serde(rename = "IPV4")]
    Ipv4,
    #[serde(rename = "IPV6")]
    Ipv6,
}

/// `{addr_type, ip, Port}`, a GTP endpoint address as carried in `create_tun`/`destroy_tun`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEndpoint {
    pub addr_type: AddrType,
    pub ip: String,
    #[serde(rename = "Port")]
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EndpointParseError {
    #[error("ip hex string is not valid hex")]
    BadHex,
    #[error("addr_type IPV4 requires 4 address bytes, got {0}")]
    WrongIpv4Len(usize),
    #[error("addr_type IPV6 requires 16 address bytes, got {0}")]
    WrongIpv6Len(usize),
}

impl WireEndpoint {
    /// Resolves the wire endpoint into a concrete [`SocketAddr`], validating that the hex
    /// address has the byte length implied by `addr_type`.
    pub fn to_socket_addr(&self) -> Result<SocketAddr, EndpointParseError> {
        let bytes = decode_hex(&self.ip).map_err(|_| EndpointParseError::BadHex)?;

        let ip = match self.addr_type {
            AddrType::Ipv4 => {
                let octets: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| EndpointParseError::WrongIpv4Len(bytes.len()))?;
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            AddrType::Ipv6 => {
                let octets: [u8; 16] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| EndpointParseError::WrongIpv6Len(bytes.len()))?;
                IpAddr::V6(Ipv6Addr::from(octets))
            }
        };

        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => WireEndpoint {
                addr_type: AddrType::Ipv4,
                ip: encode_hex(&v4.ip().octets()),
                port: v4.port(),
            },
            SocketAddr::V6(v6) => WireEndpoint {
                addr_type: AddrType::Ipv6,
                ip: encode_hex(&v6.ip().octets()),
                port: v6.port(),
            },
        }
    }
}

/// The wire-visible result code carried by every `*_res` PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireResult {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ERR_INVALID_DATA")]
    ErrInvalidData,
    #[serde(rename = "ERR_NOT_FOUND")]
    ErrNotFound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTunReq {
    pub tx_teid: u32,
    pub rx_teid: u32,
    pub user_addr_type: AddrType,
    pub user_addr: String,
    pub local_gtp_ep: WireEndpoint,
    pub remote_gtp_ep: WireEndpoint,
    pub tun_dev_name: String,
    #[serde(default)]
    pub tun_netns_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleResult {
    pub result: WireResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyTunReq {
    pub local_gtp_ep: WireEndpoint,
    pub rx_teid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartProgramReq {
    pub command: String,
    #[serde(default)]
    pub environment: Option<Vec<String>>,
    pub run_as_user: String,
    #[serde(default)]
    pub tun_netns_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartProgramRes {
    pub result: WireResult,
    pub pid: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramTermInd {
    pub pid: i64,
    pub exit_code: i32,
}

/// A fully parsed, dispatch-ready incoming command.
///
/// `reset_all_state`'s body is `{}` and carries no fields worth a dedicated type.
#[derive(Debug, Clone)]
pub enum Command {
    CreateTun(CreateTunReq),
    DestroyTun(DestroyTunReq),
    StartProgram(StartProgramReq),
    ResetAllState,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("object does not have exactly one key, got {0}")]
    NotSingleKey(usize),
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("failed to deserialize body of {command:?}: {source}")]
    BadBody {
        command: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Command {
    /// Parses one length-framed control message: a JSON object with exactly one key
    /// naming the command, whose value is the command body.
    pub fn decode(value: serde_json::Value) -> Result<Self, DecodeError> {
        let serde_json::Value::Object(mut map) = value else {
            return Err(DecodeError::NotAnObject);
        };

        if map.len() != 1 {
            return Err(DecodeError::NotSingleKey(map.len()));
        }

        let (key, body) = map.drain().next().expect("checked len == 1 above");

        fn parse<T: serde::de::DeserializeOwned>(
            command: &str,
            body: serde_json::Value,
            ctor: impl FnOnce(T) -> Command,
        ) -> Result<Command, DecodeError> {
            serde_json::from_value(body)
                .map(ctor)
                .map_err(|source| DecodeError::BadBody {
                    command: command.to_owned(),
                    source,
                })
        }

        match key.as_str() {
            "create_tun" => parse(&key, body, Command::CreateTun),
            "destroy_tun" => parse(&key, body, Command::DestroyTun),
            "start_program" => parse(&key, body, Command::StartProgram),
            "reset_all_state" => Ok(Command::ResetAllState),
            other => Err(DecodeError::UnknownCommand(other.to_owned())),
        }
    }
}

/// Wraps a response body under its `<command>_res` key, as the wire protocol expects.
pub fn envelope(key: &str, body: impl Serialize) -> serde_json::Value {
    serde_json::json!({ key: body })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_valid_tpdu_header() {
        let mut datagram = vec![0x30, 0xFF, 0x00, 0x03, 0x00, 0x00, 0x00, 0x02];
        datagram.extend_from_slice(b"abc");

        let header = Gtp1Header::decode(&datagram).unwrap();

        assert_eq!(header.length, 3);
        assert_eq!(header.teid, 2);
    }

    #[test]
    fn rejects_short_datagram() {
        let datagram = [0x30, 0xFF, 0, 0, 0, 0, 0];

        assert!(matches!(
            Gtp1Header::decode(&datagram),
            Err(HeaderError::TooShort(7))
        ));
    }

    #[test]
    fn rejects_wrong_flags() {
        let datagram = [0x10, 0xFF, 0, 0, 0, 0, 0, 0];

        assert!(matches!(
            Gtp1Header::decode(&datagram),
            Err(HeaderError::UnexpectedFlags(0x10))
        ));
    }

    #[test]
    fn rejects_wrong_message_type() {
        let datagram = [0x30, 0x10, 0, 0, 0, 0, 0, 0];

        assert!(matches!(
            Gtp1Header::decode(&datagram),
            Err(HeaderError::UnexpectedMessageType(0x10))
        ));
    }

    #[test]
    fn rejects_length_exceeding_datagram() {
        let datagram = [0x30, 0xFF, 0x00, 0x10, 0, 0, 0, 0];

        assert!(matches!(
            Gtp1Header::decode(&datagram),
            Err(HeaderError::LengthExceedsDatagram {
                length: 16,
                received: 8
            })
        ));
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut header = [0u8; GTP1_HEADER_LEN];
        Gtp1Header::encode(&mut header, 42, 0xdead_beef);

        let mut datagram = header.to_vec();
        datagram.extend(std::iter::repeat_n(0u8, 42));

        let decoded = Gtp1Header::decode(&datagram).unwrap();
        assert_eq!(decoded.length, 42);
        assert_eq!(decoded.teid, 0xdead_beef);
    }

    #[test]
    fn hex_round_trip() {
        let bytes = [0x7f, 0x00, 0x00, 0x01];
        let hex = encode_hex(&bytes);

        assert_eq!(hex, "7f000001");
        assert_eq!(decode_hex(&hex).unwrap(), bytes);
    }

    #[test]
    fn rejects_odd_length_hex() {
        assert!(matches!(decode_hex("abc"), Err(HexError::OddLength)));
    }

    #[test]
    fn endpoint_to_socket_addr_ipv4() {
        let ep = WireEndpoint {
            addr_type: AddrType::Ipv4,
            ip: "7f000001".to_owned(),
            port: 2152,
        };

        assert_eq!(
            ep.to_socket_addr().unwrap(),
            "127.0.0.1:2152".parse().unwrap()
        );
    }

    #[test]
    fn endpoint_rejects_wrong_byte_length() {
        let ep = WireEndpoint {
            addr_type: AddrType::Ipv4,
            ip: "7f0001".to_owned(),
            port: 2152,
        };

        assert!(matches!(
            ep.to_socket_addr(),
            Err(EndpointParseError::WrongIpv4Len(3))
        ));
    }

    #[test]
    fn decodes_create_tun_command() {
        let value = serde_json::json!({
            "create_tun": {
                "tx_teid": 1,
                "rx_teid": 2,
                "user_addr_type": "IPV4",
                "user_addr": "0a000001",
                "local_gtp_ep": {"addr_type": "IPV4", "ip": "7f000001", "Port": 2152},
                "remote_gtp_ep": {"addr_type": "IPV4", "ip": "7f000002", "Port": 2152},
                "tun_dev_name": "tun0"
            }
        });

        let command = Command::decode(value).unwrap();

        assert!(matches!(command, Command::CreateTun(req) if req.rx_teid == 2 && req.tx_teid == 1));
    }

    #[test]
    fn rejects_unknown_command() {
        let value = serde_json::json!({"frobnicate": {}});

        assert!(matches!(
            Command::decode(value),
            Err(DecodeError::UnknownCommand(cmd)) if cmd == "frobnicate"
        ));
    }

    #[test]
    fn reset_all_state_response_serializes_ok() {
        let res = SimpleResult {
            result: WireResult::Ok,
        };
        let wrapped = envelope("reset_all_state_res", res);

        assert_eq!(wrapped["reset_all_state_res"]["result"], "OK");
    }
}
