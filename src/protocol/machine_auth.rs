//! Machine-auth (sentry) handshake and login-key acknowledgment.

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::messages::{
    ClientNewLoginKey, ClientNewLoginKeyAccepted, ClientUpdateMachineAuth, ClientUpdateMachineAuthResponse,
    ResultCode,
};
use crate::service::credentials::Credentials;
use tracing::{info, warn};

/// Persist one pushed sentry chunk and build the reply.
///
/// A chunk whose byte count differs from its declared length is a protocol
/// fault and never reaches storage. Storage failures are reported in-band as
/// `DISK_FULL`.
pub fn handle_update_machine_auth(
    credentials: &dyn Credentials,
    msg: &ClientUpdateMachineAuth,
) -> Result<ClientUpdateMachineAuthResponse> {
    info!(filename = %msg.filename, offset = msg.offset, bytes = msg.bytes_to_write, "Machine auth update received");

    if msg.bytes.len() != msg.bytes_to_write as usize {
        return Err(ProtocolError::ProtocolFault(format!(
            "{}: declared {}, received {}",
            constants::ERR_CHUNK_SIZE_MISMATCH,
            msg.bytes_to_write,
            msg.bytes.len()
        )));
    }

    let stored = credentials
        .write_sentry_chunk(&msg.filename, msg.offset, &msg.bytes)
        .map_err(ProtocolError::from)
        .and_then(|()| {
            credentials
                .sentry_hash()
                .ok_or_else(|| ProtocolError::Custom(constants::ERR_SENTRY_HASH_MISSING.into()))
        });

    Ok(match stored {
        Ok(hash) => ClientUpdateMachineAuthResponse {
            result: ResultCode::OK,
            filename: Some(msg.filename.clone()),
            bytes_written: msg.bytes_to_write,
            sentry_hash: Some(hash),
        },
        Err(e) => {
            warn!(filename = %msg.filename, error = %e, "Sentry write failed");
            ClientUpdateMachineAuthResponse {
                result: ResultCode::DISK_FULL,
                filename: None,
                bytes_written: 0,
                sentry_hash: None,
            }
        }
    })
}

/// Acknowledge a login key by echoing its unique id
pub fn accept_login_key(msg: &ClientNewLoginKey) -> ClientNewLoginKeyAccepted {
    info!(unique_id = msg.unique_id, "New login key received");
    ClientNewLoginKeyAccepted {
        unique_id: msg.unique_id,
    }
}
