use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Clock quality the device reports for its own time base (report 1 `timeQ`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeQuality {
    None,
    NotSynced,
    Weak,
    Strong,
    Unknown,
}

impl TimeQuality {
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            0 => Self::None,
            1 => Self::NotSynced,
            2 => Self::Weak,
            3 => Self::Strong,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::NotSynced => "NOT_SYNCED",
            Self::Weak => "WEAK",
            Self::Strong => "STRONG",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        [
            Self::None,
            Self::NotSynced,
            Self::Weak,
            Self::Strong,
            Self::Unknown,
        ]
        .into_iter()
        .find(|value| value.as_str() == code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationalState {
    Startup,
    NotReady,
    Ready,
    Charging,
    Error,
    Interrupted,
    Unknown,
}

impl OperationalState {
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            0 => Self::Startup,
            1 => Self::NotReady,
            2 => Self::Ready,
            3 => Self::Charging,
            4 => Self::Error,
            5 => Self::Interrupted,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "STARTUP",
            Self::NotReady => "NOT_READY",
            Self::Ready => "READY",
            Self::Charging => "CHARGING",
            Self::Error => "ERROR",
            Self::Interrupted => "INTERRUPTED",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        [
            Self::Startup,
            Self::NotReady,
            Self::Ready,
            Self::Charging,
            Self::Error,
            Self::Interrupted,
            Self::Unknown,
        ]
        .into_iter()
        .find(|value| value.as_str() == code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlugState {
    Unplugged,
    UnlockedNotConnected,
    LockedNotConnected,
    ConnectedUnlocked,
    ConnectedLocked,
    Unknown,
}

impl PlugState {
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            0 => Self::Unplugged,
            1 => Self::UnlockedNotConnected,
            3 => Self::LockedNotConnected,
            5 => Self::ConnectedUnlocked,
            7 => Self::ConnectedLocked,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unplugged => "UNPLUGGED",
            Self::UnlockedNotConnected => "UNLOCKED_NOT_CONNECTED",
            Self::LockedNotConnected => "LOCKED_NOT_CONNECTED",
            Self::ConnectedUnlocked => "CONNECTED_UNLOCKED",
            Self::ConnectedLocked => "CONNECTED_LOCKED",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        [
            Self::Unplugged,
            Self::UnlockedNotConnected,
            Self::LockedNotConnected,
            Self::ConnectedUnlocked,
            Self::ConnectedLocked,
            Self::Unknown,
        ]
        .into_iter()
        .find(|value| value.as_str() == code)
    }
}

/// Where a session's start/end timestamps came from.
///
/// `Server` marks timestamps anchored to the receipt time of the report,
/// which are only as accurate as the network and processing delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionTimeSource {
    WallboxNtp,
    WallboxWeak,
    Server,
    Unknown,
}

impl SessionTimeSource {
    /// Session reports carry `timeQ` either as a number or as a string;
    /// `"X"` is sent by some firmware for NTP-backed clocks.
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim() {
            "2" => Self::WallboxWeak,
            "3" | "X" => Self::WallboxNtp,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::WallboxNtp => "WALLBOX_NTP",
            Self::WallboxWeak => "WALLBOX_WEAK",
            Self::Server => "SERVER",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        [Self::WallboxNtp, Self::WallboxWeak, Self::Server, Self::Unknown]
            .into_iter()
            .find(|value| value.as_str() == code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopReason {
    Running,
    CableUnplugged,
    CardDeauthorized,
    Unknown,
}

impl StopReason {
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::CableUnplugged,
            10 => Self::CardDeauthorized,
            _ => Self::Unknown,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::CableUnplugged | Self::CardDeauthorized)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::CableUnplugged => "CABLE_UNPLUGGED",
            Self::CardDeauthorized => "CARD_DEAUTHORIZED",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        [
            Self::Running,
            Self::CableUnplugged,
            Self::CardDeauthorized,
            Self::Unknown,
        ]
        .into_iter()
        .find(|value| value.as_str() == code)
    }
}

/// Natural key of an RFID token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenKey {
    pub token_id: String,
    pub token_class: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RfidToken {
    pub id: i64,
    pub key: TokenKey,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeSessionRecord {
    pub session_id: i64,
    pub hardware_current_limit_ma: i64,
    pub energy_meter_at_start_wh: Decimal,
    pub charged_energy_wh: Decimal,
    pub started: DateTime<Utc>,
    /// `None` while the session is still in progress.
    pub ended: Option<DateTime<Utc>>,
    pub time_source: SessionTimeSource,
    pub stop_reason: StopReason,
    pub token: TokenKey,
    pub device_serial: String,
}

impl ChargeSessionRecord {
    pub fn is_open(&self) -> bool {
        self.ended.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub serial: String,
    pub product: String,
    pub firmware_version: String,
    pub time_quality: TimeQuality,
    pub state: OperationalState,
    pub plug: PlugState,
    pub enabled: bool,
    pub max_current_ma: i64,
    pub power_w: Decimal,
    pub power_factor_percent: Decimal,
    pub session_energy_wh: Decimal,
    pub total_energy_wh: Decimal,
    pub voltages_v: [i64; 3],
    pub currents_a: [Decimal; 3],
    pub uptime_s: i64,
    pub current_session: Option<ChargeSessionRecord>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl DeviceState {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            product: "unknown".to_string(),
            firmware_version: "unknown".to_string(),
            time_quality: TimeQuality::Unknown,
            state: OperationalState::Unknown,
            plug: PlugState::Unknown,
            enabled: false,
            max_current_ma: 0,
            power_w: Decimal::ZERO,
            power_factor_percent: Decimal::ZERO,
            session_energy_wh: Decimal::ZERO,
            total_energy_wh: Decimal::ZERO,
            voltages_v: [0; 3],
            currents_a: [Decimal::ZERO; 3],
            uptime_s: 0,
            current_session: None,
            last_updated: None,
        }
    }
}
