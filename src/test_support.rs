use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use serde_json::json;

use crate::adapters::db::{open_connection, run_migrations};
use crate::adapters::keba_debug_file::ScriptEvent;
use crate::app::services::SqliteWallboxStore;
use crate::domain::session_time::Clock;

static TEST_DB_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Default for FixedClock {
    fn default() -> Self {
        Self(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
                .single()
                .expect("fixed timestamp should be valid"),
        )
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

pub fn open_test_store(test_name: &str) -> SqliteWallboxStore {
    SqliteWallboxStore::new(Arc::new(Mutex::new(open_test_connection(test_name))))
}

pub fn open_test_connection(test_name: &str) -> Connection {
    let template = ensure_template_db();
    let test_db_path = unique_test_db_path(test_name);

    if let Some(parent) = test_db_path.parent() {
        std::fs::create_dir_all(parent).expect("test db dir should be creatable");
    }

    std::fs::copy(&template, &test_db_path).expect("template db should be copied");
    open_connection(test_db_path.to_string_lossy().as_ref()).expect("test db should open")
}

fn ensure_template_db() -> PathBuf {
    static TEMPLATE_PATH: OnceLock<PathBuf> = OnceLock::new();

    TEMPLATE_PATH
        .get_or_init(|| {
            let template_path = std::env::var("TEST_DB_TEMPLATE_PATH")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(default_template_path);

            if let Some(parent) = template_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).expect("template parent dir should be creatable");
            }

            let mut connection = open_connection(template_path.to_string_lossy().as_ref())
                .expect("template db opens");
            run_migrations(&mut connection).expect("template migrations should succeed");

            template_path
        })
        .clone()
}

fn default_template_path() -> PathBuf {
    if cfg!(windows) {
        Path::new(".\\data\\wallbox_test.db").to_path_buf()
    } else {
        Path::new("./data/wallbox_test.db").to_path_buf()
    }
}

fn unique_test_db_path(test_name: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let counter = TEST_DB_COUNTER.fetch_add(1, Ordering::Relaxed);
    Path::new("./target/testdb")
        .join(format!("{test_name}-{now}-{counter}.sqlite"))
        .to_path_buf()
}

/// Replies for one complete probe of a device with no current or past session.
pub fn probe_script(state: i64) -> Vec<ScriptEvent> {
    vec![
        ScriptEvent::raw("TCH-OK :done"),
        ScriptEvent::reply(json!({
            "ID": "1", "Product": "KC-P30", "Serial": "22312345",
            "Firmware": "P30 v 3.10.42", "timeQ": 3, "Sec": 100
        })),
        ScriptEvent::reply(json!({
            "ID": "2", "State": state, "Plug": 7, "Enable sys": 1,
            "Max curr": 16000, "Serial": "22312345", "Sec": 100
        })),
        ScriptEvent::reply(json!({
            "ID": "3", "U1": 231, "U2": 229, "U3": 230, "I1": 0, "I2": 0, "I3": 0,
            "P": 0, "PF": 0, "E pres": 0, "E total": 283467494,
            "Serial": "22312345", "Sec": 100
        })),
        ScriptEvent::reply(json!({"ID": "100", "Session ID": -1, "Serial": "22312345"})),
        ScriptEvent::reply(json!({"ID": "101", "Session ID": -1, "Serial": "22312345"})),
    ]
}
