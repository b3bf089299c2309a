pub const SCALES_TABLE: &str = "CREATE TABLE IF NOT EXISTS scales (
                                id INTEGER,
                                ip TEXT,
                                rs485addr INTEGER,
                                data_perf_addr INTEGER,
                                fraction TEXT
                            );";

//datetime is declared INTEGER but holds SQLite's 'YYYY-MM-DD HH:MM:SS' text
pub const DATA_TABLE: &str = "CREATE TABLE IF NOT EXISTS data (
                                scale INTEGER,
                                accumulation INTEGER,
                                event TEXT,
                                shift INTEGER,
                                fraction TEXT,
                                datetime INTEGER
                            );";

pub const DATETIME_INDEX: &str = "CREATE INDEX IF NOT EXISTS index_datetime ON data(datetime);";

/// Schema statements in the order they are applied.
pub const SCHEMA: [&str; 3] = [SCALES_TABLE, DATA_TABLE, DATETIME_INDEX];

/// Store timestamp format, matches SQLite's `datetime()` output.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
