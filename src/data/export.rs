//! Streaming readers over the event log.
//!
//! Each export runs its query on the blocking pool with its own pooled
//! connection and hands rows over a one slot channel, so the cursor only
//! advances as fast as the consumer receives. The producer stops when the
//! cursor is exhausted, on the first query or decode error, when the
//! stream is cancelled, or when the consumer drops it.

use chrono::{NaiveDateTime, TimeDelta, Timelike};
use rusqlite::{params, Connection, Params};
use std::io::Write;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::data::tables::DATETIME_FORMAT;
use crate::data::{DataRecord, DbPool};
use crate::error::{Result, StoreError};

const SELECT_ALL: &str = "SELECT scale, accumulation, event, shift, fraction, datetime FROM data";

const SELECT_SCALE_BETWEEN: &str = "SELECT scale, accumulation, event, shift, fraction, datetime
                                    FROM data
                                    WHERE scale = ?1
                                      AND datetime > ?2
                                      AND datetime < ?3";

const SELECT_BETWEEN: &str = "SELECT scale, accumulation, event, shift, fraction, datetime
                              FROM data
                              WHERE datetime > ?1
                                AND datetime < ?2";

/// How an export producer ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExportSummary {
    /// Items handed to the consumer, header line included.
    pub sent: u64,
    /// The cursor ran out. False when the export was cancelled or the
    /// consumer went away first.
    pub exhausted: bool,
}

/// Receiving end of a running export.
pub struct ExportStream<T> {
    rx: mpsc::Receiver<T>,
    cancel: watch::Sender<bool>,
    producer: JoinHandle<Result<ExportSummary>>,
}

impl<T: Send + 'static> ExportStream<T> {
    fn spawn<F>(db: Arc<DbPool>, label: &'static str, produce: F) -> Self
    where
        F: FnOnce(&Connection, &mut RowSink<T>) -> Result<()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(1);
        let (cancel, cancel_rx) = watch::channel(false);
        let runtime = Handle::current();

        let producer = tokio::task::spawn_blocking(move || {
            let mut sink = RowSink {
                tx,
                cancel: cancel_rx,
                runtime,
                sent: 0,
                exhausted: false,
            };

            let result = db
                .get()
                .map_err(StoreError::from)
                .and_then(|conn| produce(&*conn, &mut sink));

            match result {
                Ok(()) => {
                    debug!(
                        "{} export finished, {} items sent, exhausted: {}",
                        label, sink.sent, sink.exhausted
                    );
                    Ok(ExportSummary {
                        sent: sink.sent,
                        exhausted: sink.exhausted,
                    })
                }
                Err(err) => {
                    warn!("{} export stopped after {} items: {}", label, sink.sent, err);
                    Err(err)
                }
            }
        });

        ExportStream {
            rx,
            cancel,
            producer,
        }
    }

    /// Next item, or `None` once the producer is done for any reason.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Asks the producer to stop. Items already in the channel can still be
    /// received.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Stops the producer if it is still running and reports how it ended.
    ///
    /// An error here means the stream was cut short by a failed query or
    /// row, which `recv` alone can't tell apart from exhaustion.
    pub async fn finish(self) -> Result<ExportSummary> {
        let ExportStream {
            rx,
            cancel,
            producer,
        } = self;

        drop(rx);
        let summary = producer
            .await
            .map_err(|err| StoreError::Producer(err.to_string()))?;
        drop(cancel);

        summary
    }
}

impl ExportStream<String> {
    /// Drains a text export into `out`.
    pub async fn write_to<W: Write>(mut self, out: &mut W) -> Result<ExportSummary> {
        while let Some(line) = self.recv().await {
            if let Err(err) = out.write_all(line.as_bytes()) {
                self.cancel();
                return Err(err.into());
            }
        }
        out.flush()?;

        self.finish().await
    }
}

/// Producer side of an [`ExportStream`].
struct RowSink<T> {
    tx: mpsc::Sender<T>,
    cancel: watch::Receiver<bool>,
    runtime: Handle,
    sent: u64,
    exhausted: bool,
}

impl<T> RowSink<T> {
    fn is_cancelled(&self) -> bool {
        //A dropped sender means the stream itself was dropped
        self.tx.is_closed() || self.cancel.has_changed().is_err() || *self.cancel.borrow()
    }

    /// Blocks until the consumer takes `item`. Returns false when the export
    /// should stop instead.
    fn send(&mut self, item: T) -> bool {
        let tx = &self.tx;
        let cancel = &mut self.cancel;

        let delivered = self.runtime.block_on(async {
            tokio::select! {
                biased;
                _ = cancel.wait_for(|cancelled| *cancelled) => false,
                sent = tx.send(item) => sent.is_ok(),
            }
        });

        if delivered {
            self.sent += 1;
        }
        delivered
    }
}

fn produce_records<P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    sink: &mut RowSink<DataRecord>,
) -> Result<()> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;

    while !sink.is_cancelled() {
        let Some(row) = rows.next()? else {
            sink.exhausted = true;
            break;
        };

        let record = DataRecord::from_row(row)?;

        if !sink.send(record) {
            break;
        }
    }

    Ok(())
}

fn produce_lines(conn: &Connection, sep: &str, sink: &mut RowSink<String>) -> Result<()> {
    let mut stmt = conn.prepare(SELECT_ALL)?;
    let mut rows = stmt.query([])?;

    if !sink.send(DataRecord::header(sep)) {
        return Ok(());
    }

    while !sink.is_cancelled() {
        let Some(row) = rows.next()? else {
            sink.exhausted = true;
            break;
        };

        let record = DataRecord::from_row(row)?;

        if !sink.send(record.to_line(sep)) {
            break;
        }
    }

    Ok(())
}

pub fn export_data(db: Arc<DbPool>, sep: String) -> ExportStream<String> {
    ExportStream::spawn(db, "text", move |conn, sink| produce_lines(conn, &sep, sink))
}

//Stored timestamps have whole seconds, so a fractional upper bound is
//raised to the next second and every row below it stays included
fn ceil_to_second(time: NaiveDateTime) -> NaiveDateTime {
    if time.nanosecond() == 0 {
        return time;
    }

    time.with_nanosecond(0)
        .and_then(|floor| floor.checked_add_signed(TimeDelta::seconds(1)))
        .unwrap_or(time)
}

/// Events with `start < datetime < finish`, limited to one scale when
/// `scale` is given.
pub fn export_data_struct(
    db: Arc<DbPool>,
    scale: Option<i64>,
    start: NaiveDateTime,
    finish: NaiveDateTime,
) -> ExportStream<DataRecord> {
    //Truncating start is exact: a whole second row is after start iff it is
    //after start's floor
    let start = start.format(DATETIME_FORMAT).to_string();
    let finish = ceil_to_second(finish).format(DATETIME_FORMAT).to_string();

    ExportStream::spawn(db, "record", move |conn, sink| match scale {
        Some(scale) => produce_records(conn, SELECT_SCALE_BETWEEN, params![scale, start, finish], sink),
        None => produce_records(conn, SELECT_BETWEEN, params![start, finish], sink),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::test_support::*;
    use crate::data::{EventPayload, Store};
    use chrono::NaiveDate;
    use std::collections::HashMap;

    fn at(hour: u32, min: u32, sec: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .and_then(|d| d.and_hms_opt(hour, min, sec))
            .expect("valid test time")
    }

    fn seed(store: &Store) {
        insert_at(store, 1, "before", "2024-05-01 07:59:59");
        insert_at(store, 1, "at_start", "2024-05-01 08:00:00");
        insert_at(store, 1, "inside", "2024-05-01 09:30:00");
        insert_at(store, 2, "other_scale", "2024-05-01 09:31:00");
        insert_at(store, 1, "at_finish", "2024-05-01 10:00:00");
        insert_at(store, 1, "after", "2024-05-01 10:00:01");
    }

    async fn collect<T: Send + 'static>(mut stream: ExportStream<T>) -> Vec<T> {
        let mut items = vec![];
        while let Some(item) = stream.recv().await {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn struct_export_excludes_boundaries_and_other_scales() {
        let (_dir, store) = test_store();
        seed(&store);

        let records = collect(store.export_data_struct(1, at(8, 0, 0), at(10, 0, 0))).await;

        let events: Vec<&str> = records.iter().map(|r| r.event.as_str()).collect();
        assert_eq!(events, vec!["inside"]);
        assert_eq!(records[0].scale, 1);
        assert_eq!(records[0].datetime, "2024-05-01 09:30:00");
    }

    #[tokio::test]
    async fn fractional_finish_keeps_rows_of_its_second() {
        let (_dir, store) = test_store();
        seed(&store);

        let finish = at(10, 0, 0) + TimeDelta::milliseconds(500);
        let records = collect(store.export_data_struct(1, at(9, 0, 0), finish)).await;

        let events: Vec<&str> = records.iter().map(|r| r.event.as_str()).collect();
        assert_eq!(events, vec!["inside", "at_finish"]);
    }

    #[tokio::test]
    async fn fractional_start_skips_rows_of_its_second() {
        let (_dir, store) = test_store();
        seed(&store);

        let start = at(8, 0, 0) + TimeDelta::milliseconds(500);
        let records = collect(store.export_data_struct(1, start, at(9, 59, 59))).await;

        let events: Vec<&str> = records.iter().map(|r| r.event.as_str()).collect();
        assert_eq!(events, vec!["inside"]);
    }

    #[test]
    fn ceil_to_second_only_moves_fractional_times() {
        assert_eq!(ceil_to_second(at(10, 0, 0)), at(10, 0, 0));
        assert_eq!(ceil_to_second(at(10, 0, 0) + TimeDelta::milliseconds(1)), at(10, 0, 1));
        assert_eq!(
            ceil_to_second(at(23, 59, 59) + TimeDelta::milliseconds(999)).to_string(),
            "2024-05-02 00:00:00"
        );
    }

    #[tokio::test]
    async fn missing_table_closes_record_export_at_once() {
        let (_dir, store) = test_store();
        let conn = store.get_db().get().expect("should get a connection");
        conn.execute_batch("DROP TABLE data;").expect("should drop data table");
        drop(conn);

        let mut stream = store.export_data_struct(1, at(8, 0, 0), at(10, 0, 0));
        assert_eq!(stream.recv().await, None);
        assert!(matches!(stream.finish().await, Err(StoreError::Query(_))));

        let mut stream = store.export_data_struct_any_time(at(8, 0, 0), at(10, 0, 0));
        assert_eq!(stream.recv().await, None);
        assert!(matches!(stream.finish().await, Err(StoreError::Query(_))));
    }

    #[tokio::test]
    async fn missing_table_text_export_sends_no_header() {
        let (_dir, store) = test_store();
        let conn = store.get_db().get().expect("should get a connection");
        conn.execute_batch("DROP TABLE data;").expect("should drop data table");
        drop(conn);

        let mut stream = store.export_data(",");
        assert_eq!(stream.recv().await, None);
        assert!(matches!(stream.finish().await, Err(StoreError::Query(_))));
    }

    #[tokio::test]
    async fn any_time_export_spans_scales() {
        let (_dir, store) = test_store();
        seed(&store);

        let records = collect(store.export_data_struct_any_time(at(8, 0, 0), at(10, 0, 0))).await;

        let mut events: Vec<&str> = records.iter().map(|r| r.event.as_str()).collect();
        events.sort();
        assert_eq!(events, vec!["inside", "other_scale"]);
    }

    #[tokio::test]
    async fn text_export_has_header_and_one_line_per_row() {
        let (_dir, store) = test_store();
        seed(&store);

        let lines = collect(store.export_data(",")).await;

        assert_eq!(lines[0], "scale,accumulation,event,shift,fraction,datetime\r\n");
        assert_eq!(lines.len() as i64 - 1, count_rows(&store, "data"));
        assert!(lines.contains(&"1,0,inside,1,0.1,2024-05-01 09:30:00\r\n".to_string()));
        assert!(lines.iter().all(|line| line.ends_with("\r\n")));
    }

    #[tokio::test]
    async fn empty_table_exports_only_header() {
        let (_dir, store) = test_store();

        let mut stream = store.export_data("\t");
        assert_eq!(
            stream.recv().await.as_deref(),
            Some("scale\taccumulation\tevent\tshift\tfraction\tdatetime\r\n")
        );
        assert_eq!(stream.recv().await, None);

        let summary = stream.finish().await.expect("export should succeed");
        assert_eq!(summary, ExportSummary { sent: 1, exhausted: true });
    }

    #[tokio::test]
    async fn finish_reports_decode_errors() {
        let (_dir, store) = test_store();
        store.save_event(&EventPayload::new(1, 5, "start", 1, "0.1")).expect("save");
        //A NULL event can't be decoded into a record
        let conn = store.get_db().get().expect("should get a connection");
        conn.execute(
            "INSERT INTO data VALUES (1, 6, NULL, 1, '0.1', datetime('now', 'localtime'))",
            [],
        )
        .expect("should insert broken row");
        drop(conn);

        let mut stream = store.export_data(",");
        let mut lines = 0;
        while stream.recv().await.is_some() {
            lines += 1;
        }

        assert_eq!(lines, 2, "header and the readable row");
        assert!(stream.finish().await.is_err());
    }

    #[tokio::test]
    async fn cancel_stops_the_producer() {
        let (_dir, store) = test_store();
        for n in 0..50 {
            store
                .save_event(&EventPayload::new(1, n, "tick", 1, "0.1"))
                .expect("save");
        }

        let mut stream = store.export_data(",");
        assert!(stream.recv().await.is_some());
        stream.cancel();

        let summary = stream.finish().await.expect("cancelled export is not an error");
        assert!(!summary.exhausted);
        assert!(summary.sent < 51);
    }

    #[tokio::test]
    async fn dropping_the_stream_releases_the_connection() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let config = crate::config::StoreConfig {
            db_file: dir.path().join("collector.db3"),
            pool: crate::config::PoolConfig {
                max_size: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let store = Store::open(&config).expect("store should open");
        for n in 0..10 {
            store
                .save_event(&EventPayload::new(1, n, "tick", 1, "0.1"))
                .expect("save");
        }

        let mut stream = store.export_data(",");
        assert!(stream.recv().await.is_some());
        drop(stream);

        //With a single pooled connection this only succeeds once the
        //producer gave its connection back
        let store_clone = store.clone();
        tokio::task::spawn_blocking(move || store_clone.read_scales())
            .await
            .expect("task should not panic")
            .expect("connection should be free again");
    }

    #[tokio::test]
    async fn concurrent_exports_see_the_same_rows() {
        let (_dir, store) = test_store();
        for n in 0..20 {
            store
                .save_event(&EventPayload::new(n % 3, n, "tick", 1, "0.1"))
                .expect("save");
        }

        let mut fast = store.export_data(",");
        let mut slow = store.export_data(",");

        let fast_task = tokio::spawn(async move {
            let mut lines = vec![];
            while let Some(line) = fast.recv().await {
                lines.push(line);
            }
            lines
        });

        let slow_task = tokio::spawn(async move {
            let mut lines = vec![];
            while let Some(line) = slow.recv().await {
                lines.push(line);
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            }
            lines
        });

        let fast_lines = fast_task.await.expect("fast consumer");
        let slow_lines = slow_task.await.expect("slow consumer");

        let multiset = |lines: &[String]| {
            let mut counts: HashMap<String, usize> = HashMap::new();
            for line in lines {
                *counts.entry(line.clone()).or_default() += 1;
            }
            counts
        };

        assert_eq!(fast_lines.len(), 21);
        assert_eq!(multiset(&fast_lines), multiset(&slow_lines));
    }

    #[tokio::test]
    async fn write_to_drains_into_writer() {
        let (_dir, store) = test_store();
        store.save_event(&EventPayload::new(3, 42, "stop", 2, "0.5")).expect("save");

        let mut out = Vec::new();
        let summary = store.export_data(";").write_to(&mut out).await.expect("write");

        let text = String::from_utf8(out).expect("utf8");
        let lines: Vec<&str> = text.split_terminator("\r\n").collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("3;42;stop;2;0.5;"));
        assert_eq!(summary.sent, 2);
    }
}
