//! External phase coordination.
//!
//! When a workload names an `ExternalPhaseCoordinator`, every phase start
//! and stop is announced to that peer as one JSON line, and the run waits
//! for the peer to answer before carrying on. The answer is logged and
//! otherwise ignored; it only exists to make the boundary a round-trip.
//!
//! There is no timeout and no reconnect. A peer that never answers holds the
//! phase boundary forever. A peer that cannot be reached at startup turns
//! the channel into a no-op.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::net::TcpStream;
use tracing::{debug, info, warn};

use crate::orchestrator::PhaseObserver;
use crate::phase::PhaseNumber;

pub const DEFAULT_COORDINATOR_PORT: u16 = 4400;
const RESPONSE_BUFFER_SIZE: usize = 1024;

pub const BEGIN_PHASE_MESSAGE: &str = "Beginning phase";
pub const END_PHASE_MESSAGE: &str = "Ended phase";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorAddress {
    /// Empty means any local address
    #[serde(rename = "Host", default)]
    pub host: String,
    #[serde(rename = "Port", default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    DEFAULT_COORDINATOR_PORT
}

impl CoordinatorAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    fn connect_host(&self) -> &str {
        if self.host.is_empty() {
            "0.0.0.0"
        } else {
            &self.host
        }
    }
}

/// The line sent for one phase event, newline included.
pub fn phase_event(message: &str, phase: PhaseNumber) -> String {
    format!(
        "{{ \"message\": \"{}\",\"phase\":{},\"request\":{}}}\n",
        message, phase, 1
    )
}

pub struct PhaseCoordinationChannel {
    address: Option<CoordinatorAddress>,
    socket: Option<Mutex<TcpStream>>,
}

impl PhaseCoordinationChannel {
    /// A channel that never talks to anyone.
    pub fn disabled() -> Self {
        Self {
            address: None,
            socket: None,
        }
    }

    /// Connects up front so the socket exists before the first phase.
    /// Failure to connect is logged and leaves the channel disabled.
    pub fn connect(address: CoordinatorAddress) -> Self {
        let socket = match TcpStream::connect((address.connect_host(), address.port)) {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("set_nodelay failed on coordinator socket: {}", e);
                }
                Some(Mutex::new(stream))
            }
            Err(e) => {
                warn!(
                    "connect('{}',{}) failed --> '{}'",
                    address.host, address.port, e
                );
                None
            }
        };

        info!(
            "Phase coordinator ('{}',{}) connected: {}",
            address.host,
            address.port,
            socket.is_some()
        );

        Self {
            address: Some(address),
            socket,
        }
    }

    pub fn address(&self) -> Option<&CoordinatorAddress> {
        self.address.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    /// Sends one event and blocks for one response.
    ///
    /// Returns the trimmed response, or `None` when the channel is disabled
    /// or the socket failed.
    pub fn send_event(&self, message: &str, phase: PhaseNumber) -> Option<String> {
        let socket = self.socket.as_ref()?;
        let event = phase_event(message, phase);
        debug!("onPhase('{}') start", event.trim_end());

        // One lock per event keeps write and read of an event together.
        let mut stream = socket.lock();
        if let Err(e) = stream.write_all(event.as_bytes()).and_then(|_| stream.flush()) {
            warn!("Failed to send '{}' for phase {}: {}", message, phase, e);
            return None;
        }

        let mut buf = [0u8; RESPONSE_BUFFER_SIZE];
        let read = match stream.read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                warn!("Failed to read coordinator reply for phase {}: {}", phase, e);
                return None;
            }
        };

        let response = String::from_utf8_lossy(&buf[..read])
            .trim_matches(|c: char| c.is_whitespace() || c == '\0')
            .to_string();
        debug!("onPhase read '{}' {}", response, read);
        debug!("onPhase('{}') end", event.trim_end());
        Some(response)
    }
}

impl PhaseObserver for PhaseCoordinationChannel {
    fn on_phase_start(&self, phase: PhaseNumber) {
        self.send_event(BEGIN_PHASE_MESSAGE, phase);
    }

    fn on_phase_stop(&self, phase: PhaseNumber) {
        self.send_event(END_PHASE_MESSAGE, phase);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_event_line_is_exact() {
        assert_eq!(
            phase_event(BEGIN_PHASE_MESSAGE, 3),
            "{ \"message\": \"Beginning phase\",\"phase\":3,\"request\":1}\n"
        );

        let parsed: serde_json::Value =
            serde_json::from_str(phase_event(END_PHASE_MESSAGE, 12).trim_end()).unwrap();
        assert_eq!(parsed["message"], "Ended phase");
        assert_eq!(parsed["phase"], 12);
        assert_eq!(parsed["request"], 1);
    }

    #[test]
    fn test_disabled_channel_is_silent() {
        let channel = PhaseCoordinationChannel::disabled();
        assert!(!channel.is_connected());
        assert_eq!(channel.send_event(BEGIN_PHASE_MESSAGE, 0), None);
        channel.on_phase_start(0);
        channel.on_phase_stop(0);
    }

    #[test]
    fn test_address_defaults() {
        let address: CoordinatorAddress = serde_yaml::from_str("Host: ''").unwrap();
        assert_eq!(address.port, DEFAULT_COORDINATOR_PORT);
        assert_eq!(address.connect_host(), "0.0.0.0");
    }
}
