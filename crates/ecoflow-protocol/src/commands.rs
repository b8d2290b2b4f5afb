//! Engine-level command definitions
//!
//! Only the commands the engine itself issues or answers live here; device
//! specific commands come from each device table.

use crate::packet::Packet;
use crate::types::address;

/// Command set used for authentication
pub const CMD_SET_AUTH: u8 = 0x35;
/// Command set used for time synchronisation
pub const CMD_SET_TIME: u8 = 0x01;

/// Commands handled by the connection engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Query whether the device already knows this client
    AuthStatus,
    /// Send MD5(user_id ++ serial) credentials
    AutoAuthentication,
    /// Device asks the client for the current time
    TimeSyncRequest,
    /// Client reply carrying the current time
    TimeSyncReply,
}

impl Command {
    /// `(cmd_set, cmd_id)` pair
    #[must_use]
    pub fn ids(self) -> (u8, u8) {
        match self {
            Command::AuthStatus => (CMD_SET_AUTH, 0x89),
            Command::AutoAuthentication => (CMD_SET_AUTH, 0x86),
            Command::TimeSyncRequest => (CMD_SET_TIME, 0x53),
            Command::TimeSyncReply => (CMD_SET_TIME, 0x52),
        }
    }

    #[must_use]
    pub fn from_ids(cmd_set: u8, cmd_id: u8) -> Option<Self> {
        match (cmd_set, cmd_id) {
            (CMD_SET_AUTH, 0x89) => Some(Command::AuthStatus),
            (CMD_SET_AUTH, 0x86) => Some(Command::AutoAuthentication),
            (CMD_SET_TIME, 0x53) => Some(Command::TimeSyncRequest),
            (CMD_SET_TIME, 0x52) => Some(Command::TimeSyncReply),
            _ => None,
        }
    }

    /// Whether `packet` carries this command
    #[must_use]
    pub fn matches(self, packet: &Packet) -> bool {
        self.ids() == (packet.cmd_set(), packet.cmd_id())
    }

    /// Build a client-to-device packet for this command
    #[must_use]
    pub fn packet(self, payload: Vec<u8>) -> Packet {
        let (cmd_set, cmd_id) = self.ids();
        Packet::new(address::APP, address::IOT, cmd_set, cmd_id, payload)
    }
}

/// Time sync reply payload: UTC seconds (u32 LE) and UTC offset in hours
#[must_use]
pub fn time_sync_payload(unix_secs: u32, utc_offset_hours: i8) -> Vec<u8> {
    let mut payload = unix_secs.to_le_bytes().to_vec();
    payload.push(utc_offset_hours as u8);
    payload
}
