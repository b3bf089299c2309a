use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::data::{DataRecord, Scale};
use crate::error::Result;

const SELECT_SCALES: &str = "SELECT id, ip, rs485addr, data_perf_addr, fraction FROM scales";

const SELECT_SCALE: &str = "SELECT id, ip, rs485addr, data_perf_addr, fraction
                            FROM scales
                            WHERE id = ?1
                            LIMIT 1";

const SELECT_LATEST_EVENTS: &str = "SELECT scale, accumulation, event, shift, fraction, datetime, rowid
                                    FROM data
                                    WHERE scale = ?1
                                    ORDER BY datetime DESC, rowid DESC
                                    LIMIT ?2";

/// Reads every registry row whose id is below `scales_count`.
///
/// Rows that can't be decoded or that lie out of range are skipped, so the
/// result may be partial. A query that fails to run, or fails while stepping
/// to the next row, is an error.
pub fn read_scales(conn: &Connection, scales_count: u32) -> Result<BTreeMap<u32, Scale>> {
    let mut stmt = conn
        .prepare(SELECT_SCALES)
        .inspect_err(|err| warn!("can't read scales: {}", err))?;

    let mut rows = stmt
        .query([])
        .inspect_err(|err| warn!("can't read scales: {}", err))?;

    let mut scales = BTreeMap::new();

    while let Some(row) = rows.next()? {
        let scale = match Scale::from_row(row) {
            Ok(scale) => scale,
            Err(err) => {
                warn!("skipping unreadable scales row: {}", err);
                continue;
            }
        };

        if scale.id >= scales_count {
            warn!("skipping scale {}, registry holds {} scales", scale.id, scales_count);
            continue;
        }

        scales.insert(scale.id, scale);
    }

    debug!("Read {} scales", scales.len());
    Ok(scales)
}

pub fn read_scale(conn: &Connection, id: u32) -> Result<Option<Scale>> {
    let scale = conn
        .query_row(SELECT_SCALE, params![id], Scale::from_row)
        .optional()
        .inspect_err(|err| warn!("can't read scale {}: {}", id, err))?;

    Ok(scale)
}

/// Newest events first, paired with their rowid.
pub fn latest_events(conn: &Connection, scale: i64, limit: u32) -> Result<Vec<(i64, DataRecord)>> {
    let mut stmt = conn.prepare(SELECT_LATEST_EVENTS)?;

    let mut rows = stmt.query(params![scale, limit])?;

    let mut result = vec![];

    while let Some(row) = rows.next()? {
        let record = DataRecord::from_row(row)?;
        let rowid: i64 = row.get(6)?;

        result.push((rowid, record));
    }

    Ok(result)
}
