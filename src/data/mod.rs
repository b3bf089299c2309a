//! SQLite persistence for scale telemetry.
//!
//! [`Store`] owns the connection pool and is the only way the rest of the
//! collector touches the database: the scale registry, the append-only event
//! log with its duplicate-write guard, and the streaming exporters.

use chrono::NaiveDateTime;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, instrument};

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};

pub mod export;
pub mod read;
pub mod tables;
pub mod write;

pub use export::{ExportStream, ExportSummary};

pub type DbPool = Pool<SqliteConnectionManager>;

/// A registered scale and its bus addressing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scale {
    pub id: u32,
    pub ip: String,
    pub rs485_addr: i64,
    pub data_perf_addr: i64,
    pub fraction: String,
}

impl Scale {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Scale {
            id: row.get(0)?,
            ip: row.get(1)?,
            rs485_addr: row.get(2)?,
            data_perf_addr: row.get(3)?,
            fraction: row.get(4)?,
        })
    }
}

/// One row of the event log.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataRecord {
    pub scale: i64,
    pub accumulation: i64,
    pub event: String,
    pub shift: i64,
    pub fraction: String,
    pub datetime: String,
}

impl DataRecord {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(DataRecord {
            scale: row.get(0)?,
            accumulation: row.get(1)?,
            event: row.get(2)?,
            shift: row.get(3)?,
            fraction: row.get(4)?,
            datetime: row.get(5)?,
        })
    }

    pub fn header(sep: &str) -> String {
        format!("scale{sep}accumulation{sep}event{sep}shift{sep}fraction{sep}datetime\r\n")
    }

    /// Renders the record as one export line. Separators inside field values
    /// are not escaped.
    pub fn to_line(&self, sep: &str) -> String {
        format!(
            "{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}{}\r\n",
            self.scale, self.accumulation, self.event, self.shift, self.fraction, self.datetime
        )
    }
}

/// The caller supplied part of an event, the timestamp is assigned by the
/// store on insert.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPayload {
    pub scale: i64,
    pub accumulation: i64,
    pub event: String,
    pub shift: i64,
    pub fraction: String,
}

impl EventPayload {
    pub fn new(
        scale: i64,
        accumulation: i64,
        event: impl Into<String>,
        shift: i64,
        fraction: impl Into<String>,
    ) -> Self {
        EventPayload {
            scale,
            accumulation,
            event: event.into(),
            shift,
            fraction: fraction.into(),
        }
    }

    //accumulation is deliberately left out, a repeated event keeps counting
    pub(crate) fn matches(&self, record: &DataRecord) -> bool {
        record.event == self.event && record.shift == self.shift && record.fraction == self.fraction
    }
}

/// What the duplicate-write guard did after appending an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuardOutcome {
    /// The new row is the only one for its scale.
    NoHistory,
    /// The newest row for the scale is not the one just written.
    NewestMismatch,
    /// The previous row carries a different event, nothing to collapse.
    Distinct,
    /// The previous row was an identical repeat and got deleted.
    Collapsed,
}

/// Handle over the telemetry database.
///
/// Cloning is cheap, all clones share the same pool. The pool and its
/// connections are closed when the last clone is dropped.
#[derive(Clone)]
pub struct Store {
    db: Arc<DbPool>,
    scales_count: u32,
}

impl Store {
    /// Opens (or creates) the database file and makes sure the schema exists.
    #[instrument(skip(config), fields(db_file = %config.db_file.display()))]
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let busy_timeout_ms = config.pool.busy_timeout.as_millis();

        let manager = SqliteConnectionManager::file(&config.db_file).with_init(move |conn| {
            //In-memory databases answer "memory" instead of "wal"
            let _journal_mode: String =
                conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
            conn.execute_batch(&format!("PRAGMA busy_timeout = {};", busy_timeout_ms))
        });

        let db = Pool::builder()
            .max_size(config.pool.max_size)
            .build(manager)?;

        Self::from_pool(Arc::new(db), config.scales_count)
    }

    /// Wraps an existing pool, running the schema initializer on it.
    pub fn from_pool(db: Arc<DbPool>, scales_count: u32) -> Result<Self> {
        let conn = db.get()?;
        init_schema(&conn)?;

        Ok(Store { db, scales_count })
    }

    pub fn get_db(&self) -> Arc<DbPool> {
        self.db.clone()
    }

    pub fn scales_count(&self) -> u32 {
        self.scales_count
    }

    fn check_scale_id(&self, id: u32) -> Result<()> {
        if id >= self.scales_count {
            return Err(StoreError::ScaleOutOfRange {
                id,
                max: self.scales_count,
            });
        }
        Ok(())
    }

    /// Replaces the registry entry for `id`.
    pub fn save_scale(
        &self,
        id: u32,
        data_perf_addr: i64,
        ip: &str,
        rs485_addr: i64,
        fraction: &str,
    ) -> Result<()> {
        self.check_scale_id(id)?;

        let scale = Scale {
            id,
            ip: ip.to_string(),
            rs485_addr,
            data_perf_addr,
            fraction: fraction.to_string(),
        };

        let conn = self.db.get()?;
        write::save_scale(&conn, &scale)
    }

    /// Removes the registry entry for `id`. A missing entry is not an error.
    pub fn clear_scale(&self, id: u32) -> Result<()> {
        let conn = self.db.get()?;
        write::clear_scale(&conn, id)
    }

    /// Reads the whole registry, keyed by scale id.
    pub fn read_scales(&self) -> Result<BTreeMap<u32, Scale>> {
        let conn = self.db.get()?;
        read::read_scales(&conn, self.scales_count)
    }

    pub fn read_scale(&self, id: u32) -> Result<Option<Scale>> {
        self.check_scale_id(id)?;

        let conn = self.db.get()?;
        read::read_scale(&conn, id)
    }

    pub fn save_scale_fraction(&self, id: u32, fraction: &str) -> Result<()> {
        self.check_scale_id(id)?;

        let conn = self.db.get()?;
        write::save_scale_fraction(&conn, id, fraction)
    }

    /// Appends one event to the log.
    pub fn save_event(&self, payload: &EventPayload) -> Result<()> {
        let conn = self.db.get()?;
        write::save_event(&conn, payload)
    }

    /// Appends one event and collapses it with the previous row for the
    /// same scale when both carry the same event, shift and fraction.
    pub fn periodic_save(&self, payload: &EventPayload) -> Result<GuardOutcome> {
        let conn = self.db.get()?;
        write::periodic_save(&conn, payload)
    }

    /// Streams the whole event log as separator delimited lines, header
    /// first.
    ///
    /// Must be called from within a tokio runtime.
    pub fn export_data(&self, sep: &str) -> ExportStream<String> {
        export::export_data(self.get_db(), sep.to_string())
    }

    /// Streams the events of one scale with `start < datetime < finish`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn export_data_struct(
        &self,
        scale: i64,
        start: NaiveDateTime,
        finish: NaiveDateTime,
    ) -> ExportStream<DataRecord> {
        export::export_data_struct(self.get_db(), Some(scale), start, finish)
    }

    /// Streams the events of every scale with `start < datetime < finish`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn export_data_struct_any_time(
        &self,
        start: NaiveDateTime,
        finish: NaiveDateTime,
    ) -> ExportStream<DataRecord> {
        export::export_data_struct(self.get_db(), None, start, finish)
    }
}

/// Creates the tables and the datetime index when missing.
///
/// Stops at the first failing statement.
pub fn init_schema(conn: &Connection) -> Result<()> {
    for statement in tables::SCHEMA {
        if let Err(err) = conn.execute(statement, []) {
            error!("schema statement failed: {}: {}", err, statement);
            return Err(StoreError::Schema {
                statement,
                source: err,
            });
        }
    }

    debug!("Schema ready");
    Ok(())
}
