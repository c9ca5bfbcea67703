use crate::adapters::channel::RequestResponseChannel;
use crate::adapters::db::SessionWrite;
use crate::adapters::keba_udp::Transport;
use crate::app::probe::{ProbeError, fetch_report};
use crate::app::services::{ServiceError, WallboxStore};
use crate::domain::keba_payload::{HISTORY_DEPTH, Report, ReportKind, SessionSlot};
use crate::domain::models::ChargeSessionRecord;
use crate::domain::session_time::Clock;

/// Walks the device's session ring buffer from newest to oldest and persists
/// completed sessions the store has not seen yet.
pub struct SessionHistoryScanner<'a, T, S, C> {
    channel: &'a mut RequestResponseChannel<T>,
    store: &'a S,
    clock: &'a C,
}

impl<'a, T, S, C> SessionHistoryScanner<'a, T, S, C>
where
    T: Transport,
    S: WallboxStore,
    C: Clock,
{
    pub fn new(channel: &'a mut RequestResponseChannel<T>, store: &'a S, clock: &'a C) -> Self {
        Self {
            channel,
            store,
            clock,
        }
    }

    /// Returns the newly persisted sessions, newest first.
    pub fn scan(&mut self) -> Result<Vec<ChargeSessionRecord>, ProbeError> {
        let mut discovered = Vec::new();

        for slot in 1..=HISTORY_DEPTH {
            let Some(kind) = ReportKind::history_slot(slot) else {
                break;
            };

            let record = match self.fetch_slot(kind)? {
                SessionSlot::Empty => {
                    tracing::debug!(slot, "reached end of session history");
                    break;
                }
                SessionSlot::Session(record) => record,
            };

            if is_still_running(&record) {
                tracing::debug!(slot, session_id = record.session_id, "skipping running session");
                continue;
            }

            match self.store.find_session(record.session_id) {
                Ok(Some(stored)) => {
                    if stored.is_open() {
                        self.complete(&record);
                    }
                    tracing::debug!(slot, session_id = record.session_id, "reached known session");
                    break;
                }
                Ok(None) => {
                    if self.persist(&record) {
                        discovered.push(record);
                    }
                }
                Err(error) => tracing::warn!(
                    slot,
                    session_id = record.session_id,
                    error = %error,
                    "failed to look up session"
                ),
            }
        }

        Ok(discovered)
    }

    fn fetch_slot(&mut self, kind: ReportKind) -> Result<SessionSlot, ProbeError> {
        match fetch_report(self.channel, kind, self.clock)? {
            Report::Session(report) => Ok(report.slot),
            other => Err(ProbeError::UnexpectedReport {
                expected: kind.id(),
                actual: other.kind().id(),
            }),
        }
    }

    fn persist(&self, record: &ChargeSessionRecord) -> bool {
        let result = self
            .store
            .get_or_create_token(&record.token.token_id, &record.token.token_class)
            .and_then(|_| self.store.save_session(record));

        match result {
            Ok(_) => {
                tracing::info!(
                    session_id = record.session_id,
                    started = %record.started,
                    charged_energy_wh = %record.charged_energy_wh,
                    stop_reason = record.stop_reason.as_str(),
                    "charging session persisted"
                );
                true
            }
            Err(error) => {
                log_store_failure(record, &error);
                false
            }
        }
    }

    fn complete(&self, record: &ChargeSessionRecord) {
        match self.store.save_session(record) {
            Ok(SessionWrite::Completed) => tracing::info!(
                session_id = record.session_id,
                stop_reason = record.stop_reason.as_str(),
                "open charging session completed"
            ),
            Ok(_) => {}
            Err(error) => log_store_failure(record, &error),
        }
    }
}

/// A slot that mirrors the live session rather than a finished one.
fn is_still_running(record: &ChargeSessionRecord) -> bool {
    !record.stop_reason.is_terminal() && record.ended.is_none()
}

fn log_store_failure(record: &ChargeSessionRecord, error: &ServiceError) {
    tracing::warn!(
        session_id = record.session_id,
        error = %error,
        "failed to persist charging session"
    );
}
