use crate::transport::ConnectionState;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, warn};

/// Session-level state, layered above [`ConnectionState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientState {
    LoggedOff,
    Connecting,
    LoggingIn,
    LoggedOn,
    LogonFailed,
    Lost,
}

impl ClientState {
    /// Whether `self -> next` is a legal move.
    ///
    /// Logon always passes through `LoggingIn`, which is only entered from
    /// `Connecting`; a logon outcome is only accepted while `LoggingIn`.
    pub fn can_transition_to(self, next: ClientState) -> bool {
        match next {
            ClientState::LoggingIn => self == ClientState::Connecting,
            ClientState::LoggedOn | ClientState::LogonFailed => self == ClientState::LoggingIn,
            ClientState::LoggedOff | ClientState::Connecting | ClientState::Lost => true,
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::LoggedOff => "LOGGED_OFF",
            ClientState::Connecting => "CONNECTING",
            ClientState::LoggingIn => "LOGGING_IN",
            ClientState::LoggedOn => "LOGGED_ON",
            ClientState::LogonFailed => "LOGON_FAILED",
            ClientState::Lost => "LOST",
        };
        f.write_str(name)
    }
}

/// Published on the client's bus identity for every session state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientStateChanged {
    pub previous: ClientState,
    pub current: ClientState,
}

/// What the client knows about its session
#[derive(Debug, Clone)]
pub struct Session {
    pub(crate) connection_state: ConnectionState,
    pub(crate) client_state: ClientState,
    pub(crate) public_ip: Option<Ipv4Addr>,
    pub(crate) heartbeat_interval: Option<Duration>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            connection_state: ConnectionState::Disconnected,
            client_state: ClientState::LoggedOff,
            public_ip: None,
            heartbeat_interval: None,
        }
    }
}

impl Session {
    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn client_state(&self) -> ClientState {
        self.client_state
    }

    /// Address the server reported at logon
    pub fn public_ip(&self) -> Option<Ipv4Addr> {
        self.public_ip
    }

    /// Interval of the armed heartbeat
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval
    }

    /// Move to `next`. Returns the change when one was made.
    pub(crate) fn transition(&mut self, next: ClientState) -> Option<ClientStateChanged> {
        if self.client_state == next {
            debug!(state = %next, "Client state unchanged");
            return None;
        }
        if !self.client_state.can_transition_to(next) {
            warn!(from = %self.client_state, to = %next, "Refusing client state transition");
            return None;
        }

        let previous = std::mem::replace(&mut self.client_state, next);
        if previous == ClientState::LoggedOn {
            self.heartbeat_interval = None;
        }
        debug!(%previous, current = %next, "Client state changed");
        Some(ClientStateChanged {
            previous,
            current: next,
        })
    }
}
