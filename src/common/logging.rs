use anyhow::{anyhow, Result};
use clap::ValueEnum;
use std::io;
use std::path::Path;
use tracing::Level;
use tracing_appender::rolling;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq)]
pub enum LogLevel {
    No,
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn to_tracing_level(&self) -> Option<Level> {
        match self {
            LogLevel::No => None,
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Info => Some(Level::INFO),
            LogLevel::Warning => Some(Level::WARN),
            LogLevel::Error => Some(Level::ERROR),
        }
    }
}

/// Installs the global tracing subscriber.
///
/// With an empty `log_file` events go to stdout, otherwise to a daily
/// rolling file in the current directory. The returned guard flushes the
/// file writer and must be kept alive for the whole process.
pub fn init_logger(
    log_level: LogLevel,
    log_file: &str,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let Some(level) = log_level.to_tracing_level() else {
        return Ok(None);
    };

    let env_filter = EnvFilter::from_default_env().add_directive(LevelFilter::from_level(level).into());

    if !log_file.is_empty() {
        let file_name = Path::new(log_file);
        let directory = file_name
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let prefix = file_name
            .file_name()
            .ok_or_else(|| anyhow!("log file {} has no file name", log_file))?;

        let file_appender = rolling::daily(directory, prefix);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let subscriber = fmt()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_env_filter(env_filter)
            .with_file(false)
            .with_target(false)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| anyhow!("Couldn't set file log subscriber: {}", e))?;

        //We need to keep the worker guard alive
        Ok(Some(guard))
    } else {
        let subscriber = fmt()
            .with_writer(io::stdout)
            .with_env_filter(env_filter)
            .with_file(false)
            .with_target(false)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| anyhow!("Couldn't set stdout log subscriber: {}", e))?;

        Ok(None)
    }
}
