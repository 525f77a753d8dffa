//! Typed payloads and the codec seam.
//!
//! Every payload type implements [`ClientMessage`], which binds it to one
//! opcode and supplies its byte encoding. The default encoding is bincode;
//! a type backed by an external schema overrides `encode`/`decode`.

use crate::core::envelope::Opcode;
use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;

/// A payload type with a fixed opcode and a wire encoding
pub trait ClientMessage: Any + Send + Sync + fmt::Debug + Serialize + DeserializeOwned {
    const OPCODE: Opcode;

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Opcodes of the baseline protocol
pub mod opcodes {
    use crate::core::envelope::Opcode;

    pub const CLIENT_HEARTBEAT: Opcode = 703;
    pub const CLIENT_CHANGE_STATUS: Opcode = 716;
    pub const CLIENT_LOGON_RESPONSE: Opcode = 751;
    pub const CLIENT_ACCOUNT_INFO: Opcode = 768;
    pub const CLIENT_NEW_LOGIN_KEY: Opcode = 5463;
    pub const CLIENT_NEW_LOGIN_KEY_ACCEPTED: Opcode = 5464;
    pub const CLIENT_GAMES_PLAYED: Opcode = 5482;
    pub const CLIENT_LOGON: Opcode = 5514;
    pub const CLIENT_UPDATE_MACHINE_AUTH: Opcode = 5537;
    pub const CLIENT_UPDATE_MACHINE_AUTH_RESPONSE: Opcode = 5538;
    pub const CLIENT_PLAYING_SESSION_STATE: Opcode = 9600;
}

/// Protocol-level outcome returned by the server.
///
/// The set is open: unknown codes are carried through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultCode(pub u32);

impl ResultCode {
    pub const OK: ResultCode = ResultCode(1);
    pub const FAIL: ResultCode = ResultCode(2);
    pub const INVALID_PASSWORD: ResultCode = ResultCode(5);
    pub const FILE_NOT_FOUND: ResultCode = ResultCode(9);
    pub const DISK_FULL: ResultCode = ResultCode(54);
    pub const ACCOUNT_LOGON_DENIED: ResultCode = ResultCode(63);

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::OK => f.write_str("OK"),
            Self::FAIL => f.write_str("FAIL"),
            Self::INVALID_PASSWORD => f.write_str("INVALID_PASSWORD"),
            Self::FILE_NOT_FOUND => f.write_str("FILE_NOT_FOUND"),
            Self::DISK_FULL => f.write_str("DISK_FULL"),
            Self::ACCOUNT_LOGON_DENIED => f.write_str("ACCOUNT_LOGON_DENIED"),
            Self(other) => write!(f, "RESULT({other})"),
        }
    }
}

/// Client operating system reported with games-played
pub const OS_TYPE_UNKNOWN: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientLogon {
    pub protocol_version: u32,
    pub account_name: String,
    pub password: String,
    /// `OK` when `sentry_hash` is present, `FILE_NOT_FOUND` otherwise
    pub sentry_file_result: ResultCode,
    pub sentry_hash: Option<Vec<u8>>,
}

impl ClientMessage for ClientLogon {
    const OPCODE: Opcode = opcodes::CLIENT_LOGON;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientLogonResponse {
    pub result: ResultCode,
    pub heartbeat_seconds: u32,
    pub public_ip: Option<u32>,
}

impl ClientMessage for ClientLogonResponse {
    const OPCODE: Opcode = opcodes::CLIENT_LOGON_RESPONSE;
}

/// Chunked sentry write pushed by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientUpdateMachineAuth {
    pub filename: String,
    pub offset: u64,
    pub bytes_to_write: u32,
    pub bytes: Vec<u8>,
}

impl ClientMessage for ClientUpdateMachineAuth {
    const OPCODE: Opcode = opcodes::CLIENT_UPDATE_MACHINE_AUTH;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientUpdateMachineAuthResponse {
    pub result: ResultCode,
    pub filename: Option<String>,
    pub bytes_written: u32,
    pub sentry_hash: Option<Vec<u8>>,
}

impl ClientMessage for ClientUpdateMachineAuthResponse {
    const OPCODE: Opcode = opcodes::CLIENT_UPDATE_MACHINE_AUTH_RESPONSE;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientAccountInfo {
    pub persona_name: String,
    pub country: String,
}

impl ClientMessage for ClientAccountInfo {
    const OPCODE: Opcode = opcodes::CLIENT_ACCOUNT_INFO;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientNewLoginKey {
    pub unique_id: u32,
    pub login_key: String,
}

impl ClientMessage for ClientNewLoginKey {
    const OPCODE: Opcode = opcodes::CLIENT_NEW_LOGIN_KEY;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientNewLoginKeyAccepted {
    pub unique_id: u32,
}

impl ClientMessage for ClientNewLoginKeyAccepted {
    const OPCODE: Opcode = opcodes::CLIENT_NEW_LOGIN_KEY_ACCEPTED;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHeartBeat {}

impl ClientMessage for ClientHeartBeat {
    const OPCODE: Opcode = opcodes::CLIENT_HEARTBEAT;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientPlayingSessionState {
    pub playing_blocked: bool,
    pub playing_app: u32,
}

impl ClientMessage for ClientPlayingSessionState {
    const OPCODE: Opcode = opcodes::CLIENT_PLAYING_SESSION_STATE;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GamePlayed {
    pub game_id: u64,
    pub game_extra_info: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientGamesPlayed {
    pub games_played: Vec<GamePlayed>,
    pub client_os_type: i32,
}

impl ClientMessage for ClientGamesPlayed {
    const OPCODE: Opcode = opcodes::CLIENT_GAMES_PLAYED;
}

/// Presence update sent by the presence module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientChangeStatus {
    pub persona_state: u32,
    pub player_name: Option<String>,
}

impl ClientMessage for ClientChangeStatus {
    const OPCODE: Opcode = opcodes::CLIENT_CHANGE_STATUS;
}
