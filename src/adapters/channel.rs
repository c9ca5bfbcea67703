use std::time::{Duration, Instant};

use thiserror::Error;

use crate::adapters::keba_udp::{Received, Transport, TransportError};
use crate::domain::keba_payload::{Command, Expectation};
use crate::domain::polling::{ProbeSignal, PushNotice};

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MIN_SEND_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Spacing between consecutive sends of the same request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Always the minimum send interval.
    Fixed,
    /// Minimum send interval doubled per unanswered attempt, capped at `max`.
    Exponential { max: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` resends until a reply arrives.
    pub max_attempts: Option<u32>,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    fn spacing(&self, min_send_interval: Duration, unanswered: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => min_send_interval,
            Backoff::Exponential { max } => {
                let factor = 2_u32.saturating_pow(unanswered.min(16));
                min_send_interval.saturating_mul(factor).min(max)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    pub response_timeout: Duration,
    pub min_send_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            min_send_interval: DEFAULT_MIN_SEND_INTERVAL,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("transport failed: {0}")]
    Transport(#[from] TransportError),
    #[error("no valid reply to {request} after {attempts} attempts")]
    RetriesExhausted { request: String, attempts: u32 },
}

/// Validated request/response exchange over a datagram transport.
///
/// Exactly one request is outstanding at a time. Datagrams from other
/// addresses are dropped, as are peer datagrams that do not answer the
/// pending request; neither triggers a resend.
pub struct RequestResponseChannel<T> {
    transport: T,
    options: ChannelOptions,
    last_send: Option<Instant>,
    probe_signal: Option<ProbeSignal>,
}

impl<T: Transport> RequestResponseChannel<T> {
    pub fn new(transport: T, options: ChannelOptions) -> Self {
        Self {
            transport,
            options,
            last_send: None,
            probe_signal: None,
        }
    }

    /// State-changing pushes dropped during an exchange raise `signal`.
    pub fn set_probe_signal(&mut self, signal: ProbeSignal) {
        self.probe_signal = Some(signal);
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn request(&mut self, command: Command) -> Result<Vec<u8>, ChannelError> {
        self.exchange(&command.to_bytes(), command.expectation())
    }

    pub fn exchange(
        &mut self,
        request: &[u8],
        expectation: Expectation,
    ) -> Result<Vec<u8>, ChannelError> {
        let peer = self.transport.peer();
        let mut needs_send = true;
        let mut attempts = 0_u32;
        let mut deadline = Instant::now();

        loop {
            if needs_send {
                if let Some(max_attempts) = self.options.retry.max_attempts
                    && attempts >= max_attempts
                {
                    return Err(ChannelError::RetriesExhausted {
                        request: String::from_utf8_lossy(request).into_owned(),
                        attempts,
                    });
                }

                self.pace(attempts);
                self.transport.send(request)?;
                let sent_at = Instant::now();
                self.last_send = Some(sent_at);
                deadline = sent_at + self.options.response_timeout;
                attempts += 1;
                needs_send = false;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.transport.receive(remaining)? {
                Received::TimedOut => {
                    tracing::warn!(
                        request = %String::from_utf8_lossy(request),
                        attempt = attempts,
                        "did not receive a response in time, resending"
                    );
                    needs_send = true;
                }
                Received::Datagram(datagram) if datagram.from != peer => {
                    tracing::warn!(from = %datagram.from, "ignoring packet from unauthorized address");
                }
                Received::Datagram(datagram) if !expectation.accepts(&datagram.payload) => {
                    self.note_unsolicited(request, &datagram.payload);
                }
                Received::Datagram(datagram) => return Ok(datagram.payload),
            }
        }
    }

    /// Waits up to `timeout` for one datagram from the peer.
    pub fn listen(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, ChannelError> {
        let peer = self.transport.peer();
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.transport.receive(remaining)? {
                Received::TimedOut => return Ok(None),
                Received::Datagram(datagram) if datagram.from != peer => {
                    tracing::warn!(from = %datagram.from, "ignoring packet from unauthorized address");
                }
                Received::Datagram(datagram) => return Ok(Some(datagram.payload)),
            }
        }
    }

    fn pace(&self, attempts: u32) {
        let spacing = self
            .options
            .retry
            .spacing(self.options.min_send_interval, attempts);
        if let Some(last_send) = self.last_send {
            let elapsed = last_send.elapsed();
            if elapsed < spacing {
                std::thread::sleep(spacing - elapsed);
            }
        }
    }

    fn note_unsolicited(&self, request: &[u8], payload: &[u8]) {
        let notice = PushNotice::classify(payload);
        tracing::debug!(
            request = %String::from_utf8_lossy(request),
            response = %String::from_utf8_lossy(payload),
            "response did not pass validation, ignoring"
        );

        if let (PushNotice::StateChange(field), Some(signal)) = (&notice, &self.probe_signal) {
            tracing::info!(field, "state change pushed during exchange, scheduling probe");
            signal.raise();
        }
    }
}
