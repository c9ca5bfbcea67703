use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;

use crate::domain::models::OperationalState;

/// Field names the device pushes unsolicited, one per datagram.
const PUSH_FIELDS: &[&str] = &["E pres", "Max curr", "Enable sys", "Input", "Plug", "State"];
const ENERGY_PROGRESS_FIELD: &str = "E pres";

pub const DEFAULT_CHARGING_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(3600);

/// Classification of an unsolicited datagram received while idle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushNotice {
    /// Routine `E pres` counter update.
    EnergyProgress,
    /// A field that other readings depend on changed.
    StateChange(&'static str),
    /// Not a single-field push from the known set.
    Malformed,
}

impl PushNotice {
    pub fn classify(payload: &[u8]) -> Self {
        let Ok(Value::Object(object)) = serde_json::from_slice::<Value>(payload) else {
            return Self::Malformed;
        };
        if object.len() != 1 {
            return Self::Malformed;
        }

        let Some(field) = object
            .keys()
            .next()
            .and_then(|key| PUSH_FIELDS.iter().copied().find(|field| *field == key))
        else {
            return Self::Malformed;
        };

        if field == ENERGY_PROGRESS_FIELD {
            Self::EnergyProgress
        } else {
            Self::StateChange(field)
        }
    }

    pub fn requires_probe(&self) -> bool {
        !matches!(self, Self::EnergyProgress)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollIntervals {
    pub charging: Duration,
    pub idle: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            charging: DEFAULT_CHARGING_INTERVAL,
            idle: DEFAULT_IDLE_INTERVAL,
        }
    }
}

impl PollIntervals {
    pub fn effective(&self, state: OperationalState) -> Duration {
        if state == OperationalState::Charging {
            self.charging
        } else {
            self.idle
        }
    }
}

/// Shared "probe on next iteration" flag.
///
/// Owned by the scheduler; clones are handed to components that may learn
/// about a device state change while the scheduler is busy.
#[derive(Debug, Clone, Default)]
pub struct ProbeSignal(Arc<AtomicBool>);

impl ProbeSignal {
    pub fn raised() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns whether the flag was set and clears it.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
