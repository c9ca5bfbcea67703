use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use thiserror::Error;

use crate::adapters::db;
use crate::adapters::db::{DbError, SessionWrite};
use crate::domain::models::{ChargeSessionRecord, DeviceState, RfidToken};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("database lock poisoned")]
    DbLockPoisoned,
    #[error("database operation failed: {0}")]
    Database(#[from] DbError),
}

/// Natural-key persistence the monitoring engine writes through.
pub trait WallboxStore {
    fn get_or_create_device(&self, serial: &str) -> Result<DeviceState, ServiceError>;
    fn save_device(&self, device: &DeviceState) -> Result<(), ServiceError>;
    fn find_session(&self, session_id: i64) -> Result<Option<ChargeSessionRecord>, ServiceError>;
    fn save_session(&self, session: &ChargeSessionRecord) -> Result<SessionWrite, ServiceError>;
    fn get_or_create_token(
        &self,
        token_id: &str,
        token_class: &str,
    ) -> Result<RfidToken, ServiceError>;

    fn session_exists(&self, session_id: i64) -> Result<bool, ServiceError> {
        Ok(self.find_session(session_id)?.is_some())
    }
}

#[derive(Clone)]
pub struct SqliteWallboxStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteWallboxStore {
    pub fn new(connection: Arc<Mutex<Connection>>) -> Self {
        Self { connection }
    }

    pub fn count_sessions(&self) -> Result<i64, ServiceError> {
        self.with_connection(db::count_sessions)
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&Connection) -> Result<T, DbError>,
    ) -> Result<T, ServiceError> {
        let connection = self
            .connection
            .lock()
            .map_err(|_| ServiceError::DbLockPoisoned)?;
        op(&connection).map_err(ServiceError::from)
    }
}

impl WallboxStore for SqliteWallboxStore {
    fn get_or_create_device(&self, serial: &str) -> Result<DeviceState, ServiceError> {
        self.with_connection(|connection| db::get_or_create_device(connection, serial))
    }

    fn save_device(&self, device: &DeviceState) -> Result<(), ServiceError> {
        self.with_connection(|connection| db::save_device(connection, device))
    }

    fn find_session(&self, session_id: i64) -> Result<Option<ChargeSessionRecord>, ServiceError> {
        self.with_connection(|connection| db::find_session(connection, session_id))
    }

    fn save_session(&self, session: &ChargeSessionRecord) -> Result<SessionWrite, ServiceError> {
        self.with_connection(|connection| db::save_session(connection, session))
    }

    fn get_or_create_token(
        &self,
        token_id: &str,
        token_class: &str,
    ) -> Result<RfidToken, ServiceError> {
        self.with_connection(|connection| db::get_or_create_token(connection, token_id, token_class))
    }
}

#[cfg(test)]
mod tests {
    use super::WallboxStore;
    use crate::test_support::open_test_store;

    #[test]
    fn session_exists_follows_find_session() {
        let store = open_test_store("services-exists");

        assert!(!store.session_exists(12).expect("query should succeed"));
        assert_eq!(store.count_sessions().expect("count should succeed"), 0);
    }

    #[test]
    fn devices_are_keyed_by_serial() {
        let store = open_test_store("services-devices");

        let mut device = store
            .get_or_create_device("22312345")
            .expect("device should be created");
        device.product = "KC-P30".to_string();
        store.save_device(&device).expect("device should save");

        let other = store
            .get_or_create_device("99999999")
            .expect("device should be created");
        let same = store
            .get_or_create_device("22312345")
            .expect("device should load");

        assert_eq!(other.product, "unknown");
        assert_eq!(same.product, "KC-P30");
    }
}
