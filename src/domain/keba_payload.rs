use rust_decimal::Decimal;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::models::{
    ChargeSessionRecord, OperationalState, PlugState, SessionTimeSource, StopReason, TimeQuality,
    TokenKey,
};
use crate::domain::session_time::{Clock, TimestampError, resolve_calendar, resolve_counters};

/// Number of history slots the device retains (reports 101..=130).
pub const HISTORY_DEPTH: u8 = 30;
/// `Session ID` of an empty session slot.
pub const EMPTY_SESSION_ID: i64 = -1;

const HANDSHAKE: &[u8] = b"i";
const CURRENT_SESSION_ID: u16 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportKind {
    Identity,
    Config,
    Charging,
    CurrentSession,
    /// History slot 1..=30, slot 1 being the most recent session.
    HistorySlot(u8),
}

impl ReportKind {
    pub fn history_slot(slot: u8) -> Option<Self> {
        (1..=HISTORY_DEPTH)
            .contains(&slot)
            .then_some(Self::HistorySlot(slot))
    }

    pub fn id(self) -> u16 {
        match self {
            Self::Identity => 1,
            Self::Config => 2,
            Self::Charging => 3,
            Self::CurrentSession => CURRENT_SESSION_ID,
            Self::HistorySlot(slot) => CURRENT_SESSION_ID + u16::from(slot),
        }
    }

    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            1 => Some(Self::Identity),
            2 => Some(Self::Config),
            3 => Some(Self::Charging),
            CURRENT_SESSION_ID => Some(Self::CurrentSession),
            101..=130 => u8::try_from(id - CURRENT_SESSION_ID)
                .ok()
                .and_then(Self::history_slot),
            _ => None,
        }
    }
}

/// A request the device understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Handshake,
    Report(ReportKind),
}

impl Command {
    pub fn to_bytes(self) -> Vec<u8> {
        match self {
            Self::Handshake => HANDSHAKE.to_vec(),
            Self::Report(kind) => format!("report {}", kind.id()).into_bytes(),
        }
    }

    /// The reply this command is answered with.
    pub fn expectation(self) -> Expectation {
        match self {
            Self::Handshake => Expectation::Any,
            Self::Report(kind) => Expectation::Report(kind),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handshake => f.write_str("handshake"),
            Self::Report(kind) => write!(f, "report {}", kind.id()),
        }
    }
}

/// Acceptance rule for a reply: any datagram, or a report whose `ID` matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    Any,
    Report(ReportKind),
}

impl Expectation {
    pub fn accepts(self, payload: &[u8]) -> bool {
        match self {
            Self::Any => true,
            Self::Report(kind) => report_id(payload) == Some(kind.id()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdentityReport {
    pub serial: String,
    pub product: String,
    pub firmware: String,
    pub time_quality: TimeQuality,
    pub uptime_s: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigReport {
    pub serial: Option<String>,
    pub state: OperationalState,
    pub plug: PlugState,
    pub enabled: Option<bool>,
    pub max_current_ma: Option<i64>,
    pub uptime_s: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChargingReport {
    pub serial: Option<String>,
    pub voltages_v: [i64; 3],
    pub currents_a: [Decimal; 3],
    pub power_w: Decimal,
    pub power_factor_percent: Decimal,
    pub session_energy_wh: Decimal,
    pub total_energy_wh: Decimal,
    pub uptime_s: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionSlot {
    Empty,
    Session(ChargeSessionRecord),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub kind: ReportKind,
    pub slot: SessionSlot,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Report {
    Identity(IdentityReport),
    Config(ConfigReport),
    Charging(ChargingReport),
    Session(SessionReport),
}

impl Report {
    pub fn kind(&self) -> ReportKind {
        match self {
            Self::Identity(_) => ReportKind::Identity,
            Self::Config(_) => ReportKind::Config,
            Self::Charging(_) => ReportKind::Charging,
            Self::Session(report) => report.kind,
        }
    }

    pub fn serial(&self) -> Option<&str> {
        match self {
            Self::Identity(report) => Some(&report.serial),
            Self::Config(report) => report.serial.as_deref(),
            Self::Charging(report) => report.serial.as_deref(),
            Self::Session(report) => match &report.slot {
                SessionSlot::Session(record) => Some(&record.device_serial),
                SessionSlot::Empty => None,
            },
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    Json(String),
    #[error("payload must be a JSON object")]
    InvalidPayloadType,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("field {field} has invalid value {value}")]
    InvalidField { field: &'static str, value: String },
    #[error("unknown report id: {0}")]
    UnknownReport(String),
    #[error("failed to resolve session timestamps: {0}")]
    Timestamp(#[from] TimestampError),
}

/// Decodes one device reply into a typed report.
///
/// Counters are scaled into exact decimals: `P` mW to W, `PF` 0.1 % to %,
/// `E pres`/`E total`/`E start` 0.1 Wh to Wh and `I1..I3` mA to A.
pub fn decode<C: Clock>(raw: &[u8], clock: &C) -> Result<Report, DecodeError> {
    let payload: Value =
        serde_json::from_slice(raw).map_err(|error| DecodeError::Json(error.to_string()))?;
    let object = payload.as_object().ok_or(DecodeError::InvalidPayloadType)?;

    let id_value = find_value(object, "ID").ok_or(DecodeError::MissingField("ID"))?;
    let kind = id_from_value(id_value)
        .and_then(ReportKind::from_id)
        .ok_or_else(|| DecodeError::UnknownReport(value_text(id_value)))?;

    match kind {
        ReportKind::Identity => decode_identity(object).map(Report::Identity),
        ReportKind::Config => decode_config(object).map(Report::Config),
        ReportKind::Charging => decode_charging(object).map(Report::Charging),
        ReportKind::CurrentSession | ReportKind::HistorySlot(_) => {
            decode_session(object, kind, clock).map(Report::Session)
        }
    }
}

/// Reads only the `ID` of a reply.
pub fn report_id(raw: &[u8]) -> Option<u16> {
    let payload: Value = serde_json::from_slice(raw).ok()?;
    let object = payload.as_object()?;
    find_value(object, "ID").and_then(id_from_value)
}

fn decode_identity(object: &Map<String, Value>) -> Result<IdentityReport, DecodeError> {
    Ok(IdentityReport {
        serial: required_text(object, "Serial")?,
        product: required_text(object, "Product")?,
        firmware: required_text(object, "Firmware")?,
        time_quality: TimeQuality::from_raw(required_i64(object, "timeQ")?),
        uptime_s: optional_i64(object, "Sec")?,
    })
}

fn decode_config(object: &Map<String, Value>) -> Result<ConfigReport, DecodeError> {
    Ok(ConfigReport {
        serial: optional_text(object, "Serial"),
        state: OperationalState::from_raw(required_i64(object, "State")?),
        plug: PlugState::from_raw(required_i64(object, "Plug")?),
        enabled: optional_i64(object, "Enable sys")?.map(|value| value == 1),
        max_current_ma: optional_i64(object, "Max curr")?,
        uptime_s: optional_i64(object, "Sec")?,
    })
}

fn decode_charging(object: &Map<String, Value>) -> Result<ChargingReport, DecodeError> {
    let voltage = |key| optional_i64(object, key).map(|value| value.unwrap_or(0));
    let current = |key| {
        optional_i64(object, key).map(|value| Decimal::new(value.unwrap_or(0), 3))
    };

    Ok(ChargingReport {
        serial: optional_text(object, "Serial"),
        voltages_v: [voltage("U1")?, voltage("U2")?, voltage("U3")?],
        currents_a: [current("I1")?, current("I2")?, current("I3")?],
        power_w: Decimal::new(required_i64(object, "P")?, 3),
        power_factor_percent: Decimal::new(required_i64(object, "PF")?, 1),
        session_energy_wh: Decimal::new(required_i64(object, "E pres")?, 1),
        total_energy_wh: Decimal::new(required_i64(object, "E total")?, 1),
        uptime_s: optional_i64(object, "Sec")?,
    })
}

fn decode_session<C: Clock>(
    object: &Map<String, Value>,
    kind: ReportKind,
    clock: &C,
) -> Result<SessionReport, DecodeError> {
    let session_id = required_i64(object, "Session ID")?;
    if session_id == EMPTY_SESSION_ID {
        return Ok(SessionReport {
            kind,
            slot: SessionSlot::Empty,
        });
    }

    let claimed = SessionTimeSource::from_raw(&required_raw_text(object, "timeQ")?);
    let times = if claimed == SessionTimeSource::WallboxNtp {
        resolve_calendar(
            &required_raw_text(object, "started")?,
            &required_raw_text(object, "ended")?,
        )?
    } else {
        let (times, branch) = resolve_counters(
            required_i64(object, "started[s]")?,
            required_i64(object, "ended[s]")?,
            required_i64(object, "Sec")?,
            clock.now(),
        )?;
        tracing::debug!(session_id, ?branch, "resolved session uptime counters");
        times
    };

    let mut stop_reason = StopReason::from_raw(required_i64(object, "reason")?);
    if times.ended.is_some() && stop_reason == StopReason::Running {
        // Firmware reports finished sessions as running now and then.
        stop_reason = StopReason::Unknown;
    }

    Ok(SessionReport {
        kind,
        slot: SessionSlot::Session(ChargeSessionRecord {
            session_id,
            hardware_current_limit_ma: required_i64(object, "Curr HW")?,
            energy_meter_at_start_wh: Decimal::new(required_i64(object, "E start")?, 1),
            charged_energy_wh: Decimal::new(required_i64(object, "E pres")?, 1),
            started: times.started,
            ended: times.ended,
            time_source: times.time_source,
            stop_reason,
            token: TokenKey {
                token_id: required_raw_text(object, "RFID tag")?,
                token_class: required_raw_text(object, "RFID class")?,
            },
            device_serial: required_text(object, "Serial")?,
        }),
    })
}

fn required_i64(object: &Map<String, Value>, key: &'static str) -> Result<i64, DecodeError> {
    optional_i64(object, key)?.ok_or(DecodeError::MissingField(key))
}

fn optional_i64(object: &Map<String, Value>, key: &'static str) -> Result<Option<i64>, DecodeError> {
    match find_value(object, key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => parse_i64(value)
            .map(Some)
            .ok_or_else(|| DecodeError::InvalidField {
                field: key,
                value: value_text(value),
            }),
    }
}

fn required_text(object: &Map<String, Value>, key: &'static str) -> Result<String, DecodeError> {
    optional_text(object, key).ok_or(DecodeError::MissingField(key))
}

fn optional_text(object: &Map<String, Value>, key: &str) -> Option<String> {
    find_value(object, key)
        .and_then(Value::as_str)
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

/// Text of a field the device sends either as string or as number.
fn required_raw_text(object: &Map<String, Value>, key: &'static str) -> Result<String, DecodeError> {
    match find_value(object, key) {
        Some(Value::String(text)) => Ok(text.trim().to_string()),
        Some(Value::Number(number)) => Ok(number.to_string()),
        Some(other) => Err(DecodeError::InvalidField {
            field: key,
            value: other.to_string(),
        }),
        None => Err(DecodeError::MissingField(key)),
    }
}

fn find_value<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    if let Some(value) = object.get(key) {
        return Some(value);
    }

    let normalized = normalize_key(key);
    object
        .iter()
        .find_map(|(candidate, value)| (normalize_key(candidate) == normalized).then_some(value))
}

fn normalize_key(value: &str) -> String {
    value
        .chars()
        .filter(|char| char.is_ascii_alphanumeric() || *char == '[' || *char == ']')
        .flat_map(|char| char.to_lowercase())
        .collect()
}

fn parse_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|float| float.is_finite() && float.fract() == 0.0)
                .map(|float| float as i64)
        }),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn id_from_value(value: &Value) -> Option<u16> {
    parse_i64(value).and_then(|id| u16::try_from(id).ok())
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};
    use rust_decimal_macros::dec;
    use serde_json::json;

    use super::{
        Command, DecodeError, Expectation, Report, ReportKind, SessionSlot, decode, report_id,
    };
    use crate::domain::models::{
        OperationalState, PlugState, SessionTimeSource, StopReason, TimeQuality,
    };
    use crate::domain::session_time::Clock;

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn clock() -> FixedClock {
        FixedClock(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
                .single()
                .expect("valid instant"),
        )
    }

    fn decode_json(value: serde_json::Value) -> Result<Report, DecodeError> {
        decode(value.to_string().as_bytes(), &clock())
    }

    fn session_payload(id: &str) -> serde_json::Value {
        json!({
            "ID": id,
            "Session ID": 45,
            "Curr HW": 32000,
            "E start": 283467494,
            "E pres": 41210,
            "started[s]": 40,
            "ended[s]": 45,
            "started": "2026-02-28 18:00:00.000",
            "ended": "2026-02-28 20:00:00.000",
            "reason": 1,
            "timeQ": 3,
            "RFID tag": "04a1b2c3d4e5f6",
            "RFID class": "01010400000000000000",
            "Serial": "22312345",
            "Sec": 50
        })
    }

    #[test]
    fn maps_report_ids_to_kinds() {
        assert_eq!(ReportKind::from_id(1), Some(ReportKind::Identity));
        assert_eq!(ReportKind::from_id(100), Some(ReportKind::CurrentSession));
        assert_eq!(ReportKind::from_id(101), Some(ReportKind::HistorySlot(1)));
        assert_eq!(ReportKind::from_id(130), Some(ReportKind::HistorySlot(30)));
        assert_eq!(ReportKind::from_id(131), None);
        assert_eq!(ReportKind::history_slot(0), None);
        assert_eq!(ReportKind::HistorySlot(7).id(), 107);
    }

    #[test]
    fn renders_wire_commands() {
        assert_eq!(Command::Handshake.to_bytes(), b"i".to_vec());
        assert_eq!(
            Command::Report(ReportKind::HistorySlot(3)).to_bytes(),
            b"report 103".to_vec()
        );
    }

    #[test]
    fn expectation_compares_string_id_with_requested_kind() {
        let reply = br#"{"ID":"2","State":3,"Plug":7}"#;

        assert!(Expectation::Report(ReportKind::Config).accepts(reply));
        assert!(!Expectation::Report(ReportKind::Charging).accepts(reply));
        assert!(!Expectation::Report(ReportKind::Config).accepts(b"TCH-OK :done"));
        assert!(Expectation::Any.accepts(b"TCH-OK :done"));
        assert_eq!(report_id(br#"{"E pres":12}"#), None);
    }

    #[test]
    fn decodes_identity_report() {
        let report = decode_json(json!({
            "ID": "1",
            "Product": "KC-P30-EC240422-E00",
            "Serial": "22312345",
            "Firmware": "P30 v 3.10.42 (220712-094912)",
            "timeQ": 3,
            "Sec": 4264958
        }))
        .expect("identity must decode");

        let Report::Identity(identity) = report else {
            panic!("expected identity report");
        };
        assert_eq!(identity.serial, "22312345");
        assert_eq!(identity.time_quality, TimeQuality::Strong);
        assert_eq!(identity.uptime_s, Some(4_264_958));
    }

    #[test]
    fn decodes_config_report_codes() {
        let report = decode_json(json!({
            "ID": "2",
            "State": 3,
            "Plug": 7,
            "Enable sys": 1,
            "Max curr": 16000,
            "Serial": "22312345"
        }))
        .expect("config must decode");

        let Report::Config(config) = report else {
            panic!("expected config report");
        };
        assert_eq!(config.state, OperationalState::Charging);
        assert_eq!(config.plug, PlugState::ConnectedLocked);
        assert_eq!(config.enabled, Some(true));
        assert_eq!(config.max_current_ma, Some(16_000));
    }

    #[test]
    fn scales_charging_readings_exactly() {
        let report = decode_json(json!({
            "ID": "3",
            "U1": 231, "U2": 229, "U3": "230",
            "I1": 15980, "I2": 16010, "I3": 0,
            "P": 11034567,
            "PF": 998,
            "E pres": 41213,
            "E total": 283467499
        }))
        .expect("charging must decode");

        let Report::Charging(charging) = report else {
            panic!("expected charging report");
        };
        assert_eq!(charging.voltages_v, [231, 229, 230]);
        assert_eq!(charging.currents_a, [dec!(15.980), dec!(16.010), dec!(0)]);
        assert_eq!(charging.power_w, dec!(11034.567));
        assert_eq!(charging.power_factor_percent, dec!(99.8));
        assert_eq!(charging.session_energy_wh, dec!(4121.3));
        assert_eq!(charging.total_energy_wh, dec!(28346749.9));
    }

    #[test]
    fn decodes_ntp_session_from_calendar_fields() {
        let report = decode_json(session_payload("101")).expect("session must decode");

        let Report::Session(session) = report else {
            panic!("expected session report");
        };
        assert_eq!(session.kind, ReportKind::HistorySlot(1));
        let SessionSlot::Session(record) = session.slot else {
            panic!("expected populated slot");
        };
        assert_eq!(record.session_id, 45);
        assert_eq!(record.time_source, SessionTimeSource::WallboxNtp);
        assert_eq!(record.stop_reason, StopReason::CableUnplugged);
        assert_eq!(record.charged_energy_wh, dec!(4121.0));
        assert_eq!(record.energy_meter_at_start_wh, dec!(28346749.4));
        assert_eq!(record.token.token_class, "01010400000000000000");
        assert_eq!(
            record.ended.map(|ended| ended - record.started),
            Some(TimeDelta::hours(2))
        );
    }

    #[test]
    fn ntp_session_with_zero_end_is_open() {
        let mut payload = session_payload("100");
        payload["ended"] = json!("0");
        payload["reason"] = json!(0);

        let Report::Session(session) = decode_json(payload).expect("session must decode") else {
            panic!("expected session report");
        };
        let SessionSlot::Session(record) = session.slot else {
            panic!("expected populated slot");
        };
        assert_eq!(record.ended, None);
        assert_eq!(record.stop_reason, StopReason::Running);
    }

    #[test]
    fn weak_session_is_anchored_to_server_time() {
        let mut payload = session_payload("102");
        payload["timeQ"] = json!(2);

        let Report::Session(session) = decode_json(payload).expect("session must decode") else {
            panic!("expected session report");
        };
        let SessionSlot::Session(record) = session.slot else {
            panic!("expected populated slot");
        };
        assert_eq!(record.time_source, SessionTimeSource::Server);
        assert_eq!(record.started, clock().0 - TimeDelta::seconds(10));
        assert_eq!(record.ended, Some(clock().0 - TimeDelta::seconds(5)));
    }

    #[test]
    fn finished_session_reported_as_running_becomes_unknown() {
        let mut payload = session_payload("103");
        payload["reason"] = json!(0);

        let Report::Session(session) = decode_json(payload).expect("session must decode") else {
            panic!("expected session report");
        };
        let SessionSlot::Session(record) = session.slot else {
            panic!("expected populated slot");
        };
        assert!(record.ended.is_some());
        assert_eq!(record.stop_reason, StopReason::Unknown);
    }

    #[test]
    fn empty_slot_needs_no_other_fields() {
        let report = decode_json(json!({"ID": "104", "Session ID": -1})).expect("must decode");

        assert_eq!(report.kind(), ReportKind::HistorySlot(4));
        assert_eq!(report.serial(), None);
        let Report::Session(session) = report else {
            panic!("expected session report");
        };
        assert_eq!(session.slot, SessionSlot::Empty);
    }

    #[test]
    fn surfaces_typed_errors_for_bad_payloads() {
        assert!(matches!(
            decode(b"not json", &clock()),
            Err(DecodeError::Json(_))
        ));
        assert_eq!(
            decode_json(json!([1, 2])),
            Err(DecodeError::InvalidPayloadType)
        );
        assert_eq!(
            decode_json(json!({"ID": "77"})),
            Err(DecodeError::UnknownReport("77".to_string()))
        );
        assert_eq!(
            decode_json(json!({"ID": "2", "Plug": 7})),
            Err(DecodeError::MissingField("State"))
        );
        assert_eq!(
            decode_json(json!({"ID": "2", "State": "on", "Plug": 7})),
            Err(DecodeError::InvalidField {
                field: "State",
                value: "on".to_string(),
            })
        );
    }
}
