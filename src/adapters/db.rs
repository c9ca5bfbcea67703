use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::models::{
    ChargeSessionRecord, DeviceState, OperationalState, PlugState, RfidToken, SessionTimeSource,
    StopReason, TimeQuality, TokenKey,
};

pub const LATEST_SCHEMA_VERSION: u32 = 1;

const MIGRATIONS: &[(u32, &str)] = &[(
    1,
    r#"
CREATE TABLE IF NOT EXISTS devices (
    serial TEXT PRIMARY KEY,
    product TEXT NOT NULL,
    firmware_version TEXT NOT NULL,
    time_quality TEXT NOT NULL,
    state TEXT NOT NULL,
    plug TEXT NOT NULL,
    enabled INTEGER NOT NULL,
    max_current_ma INTEGER NOT NULL,
    power_w TEXT NOT NULL,
    power_factor_percent TEXT NOT NULL,
    session_energy_wh TEXT NOT NULL,
    total_energy_wh TEXT NOT NULL,
    voltage_l1 INTEGER NOT NULL,
    voltage_l2 INTEGER NOT NULL,
    voltage_l3 INTEGER NOT NULL,
    current_l1 TEXT NOT NULL,
    current_l2 TEXT NOT NULL,
    current_l3 TEXT NOT NULL,
    uptime_s INTEGER NOT NULL,
    current_session TEXT,
    last_updated TEXT
);

CREATE TABLE IF NOT EXISTS rfid_tokens (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    token_id TEXT NOT NULL,
    token_class TEXT NOT NULL,
    name TEXT,
    CONSTRAINT rfid_tokens_unique UNIQUE (token_id, token_class)
);

CREATE TABLE IF NOT EXISTS charge_sessions (
    session_id INTEGER PRIMARY KEY,
    hardware_current_limit_ma INTEGER NOT NULL,
    energy_meter_at_start_wh TEXT NOT NULL,
    charged_energy_wh TEXT NOT NULL,
    started TEXT NOT NULL,
    ended TEXT,
    time_source TEXT NOT NULL,
    stop_reason TEXT NOT NULL,
    token_ref INTEGER NOT NULL REFERENCES rfid_tokens (id),
    device_serial TEXT NOT NULL REFERENCES devices (serial),
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_charge_sessions_started_desc
ON charge_sessions (started DESC);
"#,
)];

const DEVICE_COLUMNS: &str = "serial, product, firmware_version, time_quality, state, plug, \
    enabled, max_current_ma, power_w, power_factor_percent, session_energy_wh, total_energy_wh, \
    voltage_l1, voltage_l2, voltage_l3, current_l1, current_l2, current_l3, uptime_s, \
    current_session, last_updated";

const SESSION_SELECT: &str = "SELECT s.session_id, s.hardware_current_limit_ma,
        s.energy_meter_at_start_wh, s.charged_energy_wh, s.started, s.ended, s.time_source,
        s.stop_reason, t.token_id, t.token_class, s.device_serial
     FROM charge_sessions s
     JOIN rfid_tokens t ON t.id = s.token_ref";

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database operation failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unsupported schema version {current}; latest supported is {latest}")]
    UnsupportedSchemaVersion { current: u32, latest: u32 },
    #[error("failed to encode current session snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
#[error("unknown stored code: {0}")]
struct UnknownCode(String);

/// What `save_session` did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionWrite {
    Inserted,
    /// A stored open session received its end.
    Completed,
    /// The stored record was left as it was.
    Unchanged,
}

pub fn open_connection(path: &str) -> Result<Connection, DbError> {
    Connection::open(path).map_err(DbError::from)
}

pub fn run_migrations(connection: &mut Connection) -> Result<(), DbError> {
    let current_version = schema_version(connection)?;

    if current_version > LATEST_SCHEMA_VERSION {
        return Err(DbError::UnsupportedSchemaVersion {
            current: current_version,
            latest: LATEST_SCHEMA_VERSION,
        });
    }

    let transaction = connection.transaction()?;

    for (version, sql) in MIGRATIONS {
        if *version > current_version {
            transaction.execute_batch(sql)?;
            transaction.pragma_update(None, "user_version", version)?;
        }
    }

    transaction.commit()?;

    Ok(())
}

pub fn schema_version(connection: &Connection) -> Result<u32, DbError> {
    let version = connection.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

pub fn get_or_create_device(connection: &Connection, serial: &str) -> Result<DeviceState, DbError> {
    write_device(connection, &DeviceState::new(serial), "DO NOTHING")?;

    let device = connection.query_row(
        &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE serial = ?1"),
        params![serial],
        device_from_row,
    )?;

    Ok(device)
}

pub fn save_device(connection: &Connection, device: &DeviceState) -> Result<(), DbError> {
    write_device(
        connection,
        device,
        "DO UPDATE SET
            product = excluded.product,
            firmware_version = excluded.firmware_version,
            time_quality = excluded.time_quality,
            state = excluded.state,
            plug = excluded.plug,
            enabled = excluded.enabled,
            max_current_ma = excluded.max_current_ma,
            power_w = excluded.power_w,
            power_factor_percent = excluded.power_factor_percent,
            session_energy_wh = excluded.session_energy_wh,
            total_energy_wh = excluded.total_energy_wh,
            voltage_l1 = excluded.voltage_l1,
            voltage_l2 = excluded.voltage_l2,
            voltage_l3 = excluded.voltage_l3,
            current_l1 = excluded.current_l1,
            current_l2 = excluded.current_l2,
            current_l3 = excluded.current_l3,
            uptime_s = excluded.uptime_s,
            current_session = excluded.current_session,
            last_updated = excluded.last_updated",
    )
}

fn write_device(connection: &Connection, device: &DeviceState, on_conflict: &str) -> Result<(), DbError> {
    let current_session = device
        .current_session
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    connection.execute(
        &format!(
            "INSERT INTO devices ({DEVICE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)
             ON CONFLICT(serial) {on_conflict}"
        ),
        params![
            device.serial,
            device.product,
            device.firmware_version,
            device.time_quality.as_str(),
            device.state.as_str(),
            device.plug.as_str(),
            device.enabled,
            device.max_current_ma,
            device.power_w.to_string(),
            device.power_factor_percent.to_string(),
            device.session_energy_wh.to_string(),
            device.total_energy_wh.to_string(),
            device.voltages_v[0],
            device.voltages_v[1],
            device.voltages_v[2],
            device.currents_a[0].to_string(),
            device.currents_a[1].to_string(),
            device.currents_a[2].to_string(),
            device.uptime_s,
            current_session,
            device.last_updated.map(timestamp_to_text),
        ],
    )?;

    Ok(())
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<DeviceState> {
    let current_session = row
        .get::<_, Option<String>>(19)?
        .map(|json| {
            serde_json::from_str::<ChargeSessionRecord>(&json).map_err(|error| {
                rusqlite::Error::FromSqlConversionFailure(19, Type::Text, Box::new(error))
            })
        })
        .transpose()?;

    Ok(DeviceState {
        serial: row.get(0)?,
        product: row.get(1)?,
        firmware_version: row.get(2)?,
        time_quality: code_at(row, 3, TimeQuality::from_code)?,
        state: code_at(row, 4, OperationalState::from_code)?,
        plug: code_at(row, 5, PlugState::from_code)?,
        enabled: row.get(6)?,
        max_current_ma: row.get(7)?,
        power_w: decimal_at(row, 8)?,
        power_factor_percent: decimal_at(row, 9)?,
        session_energy_wh: decimal_at(row, 10)?,
        total_energy_wh: decimal_at(row, 11)?,
        voltages_v: [row.get(12)?, row.get(13)?, row.get(14)?],
        currents_a: [decimal_at(row, 15)?, decimal_at(row, 16)?, decimal_at(row, 17)?],
        uptime_s: row.get(18)?,
        current_session,
        last_updated: optional_timestamp_at(row, 20)?,
    })
}

pub fn get_or_create_token(
    connection: &Connection,
    token_id: &str,
    token_class: &str,
) -> Result<RfidToken, DbError> {
    connection.execute(
        "INSERT INTO rfid_tokens (token_id, token_class) VALUES (?1, ?2)
         ON CONFLICT(token_id, token_class) DO NOTHING",
        params![token_id, token_class],
    )?;

    let token = connection.query_row(
        "SELECT id, token_id, token_class, name FROM rfid_tokens
         WHERE token_id = ?1 AND token_class = ?2",
        params![token_id, token_class],
        |row| {
            Ok(RfidToken {
                id: row.get(0)?,
                key: TokenKey {
                    token_id: row.get(1)?,
                    token_class: row.get(2)?,
                },
                name: row.get(3)?,
            })
        },
    )?;

    Ok(token)
}

pub fn find_session(
    connection: &Connection,
    session_id: i64,
) -> Result<Option<ChargeSessionRecord>, DbError> {
    let session = connection
        .query_row(
            &format!("{SESSION_SELECT} WHERE s.session_id = ?1"),
            params![session_id],
            session_from_row,
        )
        .optional()?;

    Ok(session)
}

/// Inserts a session, or completes a stored one that is still open.
///
/// Closed sessions are never rewritten.
pub fn save_session(
    connection: &Connection,
    session: &ChargeSessionRecord,
) -> Result<SessionWrite, DbError> {
    let existing = find_session(connection, session.session_id)?;
    if let Some(stored) = &existing
        && (!stored.is_open() || session.is_open())
    {
        return Ok(SessionWrite::Unchanged);
    }

    get_or_create_device(connection, &session.device_serial)?;
    let token = get_or_create_token(
        connection,
        &session.token.token_id,
        &session.token.token_class,
    )?;

    if existing.is_some() {
        connection.execute(
            "UPDATE charge_sessions SET
                hardware_current_limit_ma = ?2,
                energy_meter_at_start_wh = ?3,
                charged_energy_wh = ?4,
                started = ?5,
                ended = ?6,
                time_source = ?7,
                stop_reason = ?8,
                token_ref = ?9
             WHERE session_id = ?1 AND ended IS NULL",
            params![
                session.session_id,
                session.hardware_current_limit_ma,
                session.energy_meter_at_start_wh.to_string(),
                session.charged_energy_wh.to_string(),
                timestamp_to_text(session.started),
                session.ended.map(timestamp_to_text),
                session.time_source.as_str(),
                session.stop_reason.as_str(),
                token.id,
            ],
        )?;
        return Ok(SessionWrite::Completed);
    }

    connection.execute(
        "INSERT INTO charge_sessions (session_id, hardware_current_limit_ma,
            energy_meter_at_start_wh, charged_energy_wh, started, ended, time_source,
            stop_reason, token_ref, device_serial)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            session.session_id,
            session.hardware_current_limit_ma,
            session.energy_meter_at_start_wh.to_string(),
            session.charged_energy_wh.to_string(),
            timestamp_to_text(session.started),
            session.ended.map(timestamp_to_text),
            session.time_source.as_str(),
            session.stop_reason.as_str(),
            token.id,
            session.device_serial,
        ],
    )?;

    Ok(SessionWrite::Inserted)
}

pub fn count_sessions(connection: &Connection) -> Result<i64, DbError> {
    let count = connection.query_row("SELECT COUNT(*) FROM charge_sessions", [], |row| {
        row.get(0)
    })?;
    Ok(count)
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<ChargeSessionRecord> {
    Ok(ChargeSessionRecord {
        session_id: row.get(0)?,
        hardware_current_limit_ma: row.get(1)?,
        energy_meter_at_start_wh: decimal_at(row, 2)?,
        charged_energy_wh: decimal_at(row, 3)?,
        started: timestamp_at(row, 4)?,
        ended: optional_timestamp_at(row, 5)?,
        time_source: code_at(row, 6, SessionTimeSource::from_code)?,
        stop_reason: code_at(row, 7, StopReason::from_code)?,
        token: TokenKey {
            token_id: row.get(8)?,
            token_class: row.get(9)?,
        },
        device_serial: row.get(10)?,
    })
}

fn timestamp_to_text(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn decimal_at(row: &Row<'_>, index: usize) -> rusqlite::Result<Decimal> {
    let text: String = row.get(index)?;
    Decimal::from_str(&text).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(error))
    })
}

fn timestamp_at(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(index)?;
    parse_timestamp(index, &text)
}

fn optional_timestamp_at(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(index)?
        .map(|text| parse_timestamp(index, &text))
        .transpose()
}

fn parse_timestamp(index: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|error| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(error)))
}

fn code_at<T>(row: &Row<'_>, index: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let text: String = row.get(index)?;
    parse(&text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(UnknownCode(text)))
    })
}
