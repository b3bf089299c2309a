use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use tracing::{debug, error, warn};

use crate::data::read;
use crate::data::{EventPayload, GuardOutcome, Scale};
use crate::error::{Result, StoreError};

const DELETE_SCALE: &str = "DELETE FROM scales WHERE id = ?1";

const INSERT_SCALE: &str =
    "INSERT INTO scales (id, ip, rs485addr, data_perf_addr, fraction) VALUES (?1, ?2, ?3, ?4, ?5)";

const UPDATE_SCALE_FRACTION: &str = "UPDATE scales SET fraction = ?1 WHERE id = ?2";

const INSERT_EVENT: &str = "INSERT INTO data (scale, accumulation, event, shift, fraction, datetime)
                            VALUES (?1, ?2, ?3, ?4, ?5, datetime('now', 'localtime'))";

const DELETE_DUPLICATE_EVENT: &str = "DELETE FROM data
                                      WHERE rowid = ?1
                                        AND datetime = ?2
                                        AND scale = ?3
                                        AND event = ?4
                                        AND fraction = ?5
                                        AND shift = ?6";

fn delete_scale_rows(conn: &Connection, id: u32) -> Result<usize> {
    conn.execute(DELETE_SCALE, params![id])
        .inspect_err(|err| warn!("can't clear scale {}: {}", id, err))
        .map_err(StoreError::from)
}

/// Deletes and re-inserts the registry row in one transaction.
pub fn save_scale(conn: &Connection, scale: &Scale) -> Result<()> {
    let tx = conn
        .unchecked_transaction()
        .inspect_err(|err| warn!("can't start saving scale {}: {}", scale.id, err))?;

    let removed = delete_scale_rows(&tx, scale.id)?;
    if removed > 1 {
        warn!("registry held {} rows for scale {}, all replaced", removed, scale.id);
    }

    let affected = tx
        .execute(
            INSERT_SCALE,
            params![
                scale.id,
                scale.ip,
                scale.rs485_addr,
                scale.data_perf_addr,
                scale.fraction
            ],
        )
        .inspect_err(|err| warn!("can't save scale {:?}: {}", scale, err))?;

    if affected != 1 {
        warn!("problem saving scale {}, rows affected: {}", scale.id, affected);
        return Err(StoreError::row_count("insert scale", 1, affected));
    }

    tx.commit()
        .inspect_err(|err| warn!("can't commit scale {}: {}", scale.id, err))?;

    debug!("Saved scale {:?}", scale);
    Ok(())
}

pub fn clear_scale(conn: &Connection, id: u32) -> Result<()> {
    let affected = delete_scale_rows(conn, id)?;

    if affected > 1 {
        warn!("problem clearing scale {}, rows affected: {}", id, affected);
        return Err(StoreError::row_count("clear scale", 1, affected));
    }

    debug!("Cleared scale {} ({} rows)", id, affected);
    Ok(())
}

pub fn save_scale_fraction(conn: &Connection, id: u32, fraction: &str) -> Result<()> {
    let affected = conn
        .execute(UPDATE_SCALE_FRACTION, params![fraction, id])
        .inspect_err(|err| warn!("can't save fraction {} for scale {}: {}", fraction, id, err))?;

    if affected != 1 {
        warn!("problem saving scale fraction, scale {} rows affected: {}", id, affected);
        return Err(StoreError::row_count("update scale fraction", 1, affected));
    }

    debug!("Saved fraction {} for scale {}", fraction, id);
    Ok(())
}

pub fn save_event(conn: &Connection, payload: &EventPayload) -> Result<()> {
    let affected = conn
        .execute(
            INSERT_EVENT,
            params![
                payload.scale,
                payload.accumulation,
                payload.event,
                payload.shift,
                payload.fraction
            ],
        )
        .inspect_err(|err| warn!("can't save event {:?}: {}", payload, err))?;

    if affected != 1 {
        warn!("problem saving event for scale {}, rows affected: {}", payload.scale, affected);
        return Err(StoreError::row_count("insert event", 1, affected));
    }

    debug!("Saved event {:?}", payload);
    Ok(())
}

/// Appends `payload` and, when the two newest rows of its scale both carry
/// the payload's event, shift and fraction, deletes the older one.
///
/// The new row is committed before the check and is never removed by it.
/// The check and the delete share an immediate transaction.
pub fn periodic_save(conn: &Connection, payload: &EventPayload) -> Result<GuardOutcome> {
    save_event(conn, payload)?;

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .inspect_err(|err| warn!("can't start duplicate check for scale {}: {}", payload.scale, err))?;

    let latest = read::latest_events(&tx, payload.scale, 2)
        .inspect_err(|err| warn!("can't load 2 last events for scale {}: {}", payload.scale, err))?;

    let mut latest = latest.into_iter();

    let Some((_, newest)) = latest.next() else {
        error!("no rows for scale {} right after writing one", payload.scale);
        return Err(StoreError::MissingWrite {
            scale: payload.scale,
        });
    };

    if !payload.matches(&newest) {
        return Ok(GuardOutcome::NewestMismatch);
    }

    let Some((rowid, previous)) = latest.next() else {
        debug!("only 1 saved event for scale {}", payload.scale);
        return Ok(GuardOutcome::NoHistory);
    };

    if !payload.matches(&previous) {
        return Ok(GuardOutcome::Distinct);
    }

    let affected = tx
        .execute(
            DELETE_DUPLICATE_EVENT,
            params![
                rowid,
                previous.datetime,
                payload.scale,
                payload.event,
                payload.fraction,
                payload.shift
            ],
        )
        .inspect_err(|err| warn!("can't delete double save {:?}: {}", payload, err))?;

    if affected != 1 {
        warn!("problem deleting double save for scale {}, rows affected: {}", payload.scale, affected);
        return Err(StoreError::row_count("delete double save", 1, affected));
    }

    tx.commit()
        .inspect_err(|err| warn!("can't commit double save removal for scale {}: {}", payload.scale, err))?;

    debug!("Collapsed double save {:?} at {}", payload, previous.datetime);
    Ok(GuardOutcome::Collapsed)
}
