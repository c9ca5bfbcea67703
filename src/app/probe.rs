use thiserror::Error;

use crate::adapters::channel::{ChannelError, RequestResponseChannel};
use crate::adapters::keba_udp::Transport;
use crate::app::history::SessionHistoryScanner;
use crate::app::services::{ServiceError, WallboxStore};
use crate::domain::keba_payload::{Command, DecodeError, Report, ReportKind, SessionSlot, decode};
use crate::domain::models::{ChargeSessionRecord, DeviceState, OperationalState};
use crate::domain::session_time::Clock;

const PRIMARY_REPORTS: [ReportKind; 4] = [
    ReportKind::Identity,
    ReportKind::Config,
    ReportKind::Charging,
    ReportKind::CurrentSession,
];

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("device exchange failed: {0}")]
    Channel(#[from] ChannelError),
    #[error("failed to decode report {report}: {source}")]
    Decode {
        report: u16,
        #[source]
        source: DecodeError,
    },
    #[error("requested report {expected} but decoded report {actual}")]
    UnexpectedReport { expected: u16, actual: u16 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub state: OperationalState,
    pub new_sessions: Vec<ChargeSessionRecord>,
}

/// Runs one full probe: handshake, the four primary reports and the history
/// scan, merging every decoded report into the stored device state.
pub struct ProbeSequencer<T, S, C> {
    channel: RequestResponseChannel<T>,
    store: S,
    clock: C,
    serial: Option<String>,
    last_state: OperationalState,
}

impl<T, S, C> ProbeSequencer<T, S, C>
where
    T: Transport,
    S: WallboxStore,
    C: Clock,
{
    pub fn new(channel: RequestResponseChannel<T>, store: S, clock: C) -> Self {
        Self {
            channel,
            store,
            clock,
            serial: None,
            last_state: OperationalState::Unknown,
        }
    }

    pub fn channel(&self) -> &RequestResponseChannel<T> {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut RequestResponseChannel<T> {
        &mut self.channel
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn last_state(&self) -> OperationalState {
        self.last_state
    }

    /// Reports merged before a failing exchange stay committed.
    pub fn probe(&mut self) -> Result<ProbeOutcome, ProbeError> {
        let greeting = self.channel.request(Command::Handshake)?;
        tracing::debug!(reply = %String::from_utf8_lossy(&greeting), "handshake answered");

        for kind in PRIMARY_REPORTS {
            let report = fetch_report(&mut self.channel, kind, &self.clock)?;
            if let Report::Identity(identity) = &report {
                self.serial = Some(identity.serial.clone());
            }
            if let Report::Config(config) = &report {
                self.last_state = config.state;
            }
            self.ingest(&report);
        }

        let new_sessions =
            SessionHistoryScanner::new(&mut self.channel, &self.store, &self.clock).scan()?;

        Ok(ProbeOutcome {
            state: self.last_state,
            new_sessions,
        })
    }

    fn ingest(&self, report: &Report) {
        let kind = report.kind().id();
        let Some(serial) = report.serial().or(self.serial.as_deref()) else {
            tracing::warn!(report = kind, "report carries no device serial, skipping ingestion");
            return;
        };

        if let Err(error) = self.merge(serial, report) {
            tracing::warn!(report = kind, serial, error = %error, "failed to persist report");
        }
        // Finished sessions are left to the history scan, which stops at the
        // first id already stored.
        if let Report::Session(session) = report
            && let SessionSlot::Session(record) = &session.slot
            && record.is_open()
        {
            self.persist_current_session(record);
        }
    }

    fn merge(&self, serial: &str, report: &Report) -> Result<(), ServiceError> {
        let mut device = self.store.get_or_create_device(serial)?;
        let before = device.clone();
        apply_report(&mut device, report);

        if device == before {
            tracing::trace!(report = report.kind().id(), serial, "device state unchanged");
            return Ok(());
        }

        device.last_updated = Some(self.clock.now());
        self.store.save_device(&device)
    }

    fn persist_current_session(&self, record: &ChargeSessionRecord) {
        match self.store.save_session(record) {
            Ok(write) => tracing::debug!(
                session_id = record.session_id,
                ?write,
                "current session persisted"
            ),
            Err(error) => tracing::warn!(
                session_id = record.session_id,
                error = %error,
                "failed to persist current session"
            ),
        }
    }
}

/// Requests one numbered report and decodes the validated reply.
pub(crate) fn fetch_report<T: Transport, C: Clock>(
    channel: &mut RequestResponseChannel<T>,
    kind: ReportKind,
    clock: &C,
) -> Result<Report, ProbeError> {
    let raw = channel.request(Command::Report(kind))?;
    let report = decode(&raw, clock).map_err(|source| ProbeError::Decode {
        report: kind.id(),
        source,
    })?;

    if report.kind() != kind {
        return Err(ProbeError::UnexpectedReport {
            expected: kind.id(),
            actual: report.kind().id(),
        });
    }
    Ok(report)
}

fn apply_report(device: &mut DeviceState, report: &Report) {
    match report {
        Report::Identity(identity) => {
            device.product = identity.product.clone();
            device.firmware_version = identity.firmware.clone();
            device.time_quality = identity.time_quality;
            if let Some(uptime_s) = identity.uptime_s {
                device.uptime_s = uptime_s;
            }
        }
        Report::Config(config) => {
            device.state = config.state;
            device.plug = config.plug;
            if let Some(enabled) = config.enabled {
                device.enabled = enabled;
            }
            if let Some(max_current_ma) = config.max_current_ma {
                device.max_current_ma = max_current_ma;
            }
            if let Some(uptime_s) = config.uptime_s {
                device.uptime_s = uptime_s;
            }
        }
        Report::Charging(charging) => {
            device.voltages_v = charging.voltages_v;
            device.currents_a = charging.currents_a;
            device.power_w = charging.power_w;
            device.power_factor_percent = charging.power_factor_percent;
            device.session_energy_wh = charging.session_energy_wh;
            device.total_energy_wh = charging.total_energy_wh;
            if let Some(uptime_s) = charging.uptime_s {
                device.uptime_s = uptime_s;
            }
        }
        Report::Session(session) if session.kind == ReportKind::CurrentSession => {
            device.current_session = match &session.slot {
                SessionSlot::Empty => None,
                SessionSlot::Session(record) => Some(record.clone()),
            };
        }
        Report::Session(_) => {}
    }
}
