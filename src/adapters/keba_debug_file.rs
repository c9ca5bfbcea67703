use std::fs;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::adapters::keba_udp::{Datagram, Received, Transport, TransportError};

#[derive(Debug, Clone, Deserialize)]
struct ScriptFile {
    #[serde(default = "default_loop")]
    loop_forever: bool,
    events: Vec<ScriptEvent>,
}

/// One scripted outcome of a `receive` call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptEvent {
    #[serde(default)]
    reply: Option<Value>,
    #[serde(default)]
    raw: Option<String>,
    #[serde(default)]
    timeout: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    from: Option<SocketAddr>,
}

impl ScriptEvent {
    pub fn reply(payload: Value) -> Self {
        Self {
            reply: Some(payload),
            ..Self::default()
        }
    }

    pub fn raw(payload: impl Into<String>) -> Self {
        Self {
            raw: Some(payload.into()),
            ..Self::default()
        }
    }

    pub fn timeout() -> Self {
        Self {
            timeout: true,
            ..Self::default()
        }
    }

    pub fn error(kind: impl Into<String>) -> Self {
        Self {
            error: Some(kind.into()),
            ..Self::default()
        }
    }

    /// Delivers the event as if it came from `from` instead of the peer.
    pub fn sent_by(mut self, from: SocketAddr) -> Self {
        self.from = Some(from);
        self
    }

    fn validate(&self) -> Result<(), TransportError> {
        let outcomes = [
            self.reply.is_some(),
            self.raw.is_some(),
            self.timeout,
            self.error.is_some(),
        ];
        if outcomes.iter().filter(|set| **set).count() != 1 {
            return Err(TransportError::Script(
                "script event must contain exactly one of: reply, raw, timeout or error"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

fn default_loop() -> bool {
    true
}

/// Transport replaying receive outcomes from a script and recording sends.
#[derive(Debug)]
pub struct ScriptedTransport {
    peer: SocketAddr,
    events: Vec<ScriptEvent>,
    loop_forever: bool,
    next: usize,
    sent: Vec<Vec<u8>>,
}

impl ScriptedTransport {
    pub fn from_file(path: &str, peer: SocketAddr) -> Result<Self, TransportError> {
        let content = fs::read_to_string(path)?;
        let script: ScriptFile = serde_json::from_str(&content)
            .map_err(|error| TransportError::Script(error.to_string()))?;

        if script.events.is_empty() {
            return Err(TransportError::Script(
                "debug script must contain at least one event".to_string(),
            ));
        }

        let mut transport = Self::from_events(peer, script.events)?;
        transport.loop_forever = script.loop_forever;
        Ok(transport)
    }

    pub fn from_events(peer: SocketAddr, events: Vec<ScriptEvent>) -> Result<Self, TransportError> {
        for event in &events {
            event.validate()?;
        }

        Ok(Self {
            peer,
            events,
            loop_forever: false,
            next: 0,
            sent: Vec::new(),
        })
    }

    pub fn sent(&self) -> &[Vec<u8>] {
        &self.sent
    }

    pub fn sent_commands(&self) -> Vec<String> {
        self.sent
            .iter()
            .map(|payload| String::from_utf8_lossy(payload).into_owned())
            .collect()
    }

    pub fn remaining_events(&self) -> usize {
        self.events.len().saturating_sub(self.next)
    }

    fn next_event(&mut self) -> Result<ScriptEvent, TransportError> {
        if self.next >= self.events.len() {
            if self.loop_forever && !self.events.is_empty() {
                self.next = 0;
            } else {
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "debug replay finished",
                )));
            }
        }

        let event = self.events[self.next].clone();
        self.next = self.next.saturating_add(1);
        Ok(event)
    }
}

impl Transport for ScriptedTransport {
    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.sent.push(payload.to_vec());
        Ok(())
    }

    fn receive(&mut self, _timeout: Duration) -> Result<Received, TransportError> {
        let event = self.next_event()?;
        let from = event.from.unwrap_or(self.peer);

        if let Some(kind) = event.error {
            return Err(TransportError::Io(map_script_error(&kind)));
        }
        if event.timeout {
            return Ok(Received::TimedOut);
        }

        let payload = match (event.reply, event.raw) {
            (Some(reply), _) => reply.to_string().into_bytes(),
            (None, Some(raw)) => raw.into_bytes(),
            (None, None) => return Ok(Received::TimedOut),
        };

        Ok(Received::Datagram(Datagram { payload, from }))
    }
}

fn map_script_error(kind: &str) -> io::Error {
    let normalized = kind.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "network_unreachable" | "internet_down" => {
            io::Error::new(io::ErrorKind::NetworkUnreachable, kind)
        }
        "host_unreachable" | "wallbox_unreachable" => {
            io::Error::new(io::ErrorKind::HostUnreachable, kind)
        }
        "connection_refused" => io::Error::new(io::ErrorKind::ConnectionRefused, kind),
        "broken_pipe" => io::Error::new(io::ErrorKind::BrokenPipe, kind),
        _ => io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unknown scripted error kind: {kind}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;
    use std::net::SocketAddr;
    use std::time::Duration;

    use serde_json::json;

    use super::{ScriptEvent, ScriptedTransport};
    use crate::adapters::keba_udp::{Received, Transport, TransportError};

    fn peer() -> SocketAddr {
        SocketAddr::from(([192, 168, 1, 10], 7090))
    }

    fn fixture(path: &str) -> String {
        format!(
            "{}/testdata/debug/{path}",
            env!("CARGO_MANIFEST_DIR").replace("\\", "/")
        )
    }

    fn payload_of(received: Received) -> Vec<u8> {
        match received {
            Received::Datagram(datagram) => datagram.payload,
            Received::TimedOut => panic!("expected a datagram"),
        }
    }

    #[test]
    fn replays_and_loops_scripted_datagrams() {
        let mut transport =
            ScriptedTransport::from_file(&fixture("probe_loop.json"), peer()).expect("script");
        let timeout = Duration::from_secs(5);

        let first = payload_of(transport.receive(timeout).expect("event #1"));
        assert_eq!(transport.receive(timeout).expect("event #2"), Received::TimedOut);
        let wrapped = payload_of(transport.receive(timeout).expect("looped event"));

        assert_eq!(first, wrapped);
        assert_eq!(first, br#"{"ID":"1"}"#.to_vec());
    }

    #[test]
    fn records_sent_commands() {
        let mut transport = ScriptedTransport::from_events(peer(), vec![]).expect("script");

        transport.send(b"i").expect("send");
        transport.send(b"report 2").expect("send");

        assert_eq!(transport.sent_commands(), vec!["i", "report 2"]);
    }

    #[test]
    fn delivers_datagrams_from_other_senders() {
        let stranger = SocketAddr::from(([10, 0, 0, 9], 7090));
        let mut transport = ScriptedTransport::from_events(
            peer(),
            vec![ScriptEvent::raw("spoofed").sent_by(stranger)],
        )
        .expect("script");

        match transport.receive(Duration::ZERO).expect("event") {
            Received::Datagram(datagram) => assert_eq!(datagram.from, stranger),
            Received::TimedOut => panic!("expected a datagram"),
        }
    }

    #[test]
    fn simulates_network_and_host_failures() {
        let mut transport = ScriptedTransport::from_events(
            peer(),
            vec![
                ScriptEvent::error("network_unreachable"),
                ScriptEvent::error("wallbox_unreachable"),
            ],
        )
        .expect("script");

        for expected in [ErrorKind::NetworkUnreachable, ErrorKind::HostUnreachable] {
            match transport.receive(Duration::ZERO) {
                Err(TransportError::Io(io)) => assert_eq!(io.kind(), expected),
                other => panic!("expected io error, got {other:?}"),
            }
        }
    }

    #[test]
    fn finishes_with_eof_when_not_looping() {
        let mut transport =
            ScriptedTransport::from_events(peer(), vec![ScriptEvent::reply(json!({"ID": "3"}))])
                .expect("script");

        transport.receive(Duration::ZERO).expect("first event");

        match transport.receive(Duration::ZERO) {
            Err(TransportError::Io(io)) => assert_eq!(io.kind(), ErrorKind::UnexpectedEof),
            other => panic!("expected eof, got {other:?}"),
        }
    }

    #[test]
    fn rejects_ambiguous_events() {
        let mut event = ScriptEvent::timeout();
        event.raw = Some("both".to_string());

        let result = ScriptedTransport::from_events(peer(), vec![event]);

        assert!(matches!(result, Err(TransportError::Script(_))));
    }

    #[test]
    fn rejects_script_without_events() {
        let result = ScriptedTransport::from_file(&fixture("empty_events.json"), peer());

        assert!(matches!(result, Err(TransportError::Script(_))));
    }

    #[test]
    fn rejects_invalid_top_level_json() {
        let result = ScriptedTransport::from_file(&fixture("invalid_top_level_json.json"), peer());

        assert!(matches!(result, Err(TransportError::Script(_))));
    }

    #[test]
    fn rejects_unknown_error_kind() {
        let mut transport =
            ScriptedTransport::from_events(peer(), vec![ScriptEvent::error("solar_flare")])
                .expect("script");

        match transport.receive(Duration::ZERO) {
            Err(TransportError::Io(io)) => assert_eq!(io.kind(), ErrorKind::InvalidInput),
            other => panic!("expected invalid input io error, got {other:?}"),
        }
    }
}
