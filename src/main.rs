use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};

use scale_collector::common::logging::{init_logger, LogLevel};
use scale_collector::{Scale, Store, StoreConfig};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long = "config")]
    config_file: Option<PathBuf>,
    /// Overrides the database file from the config
    #[arg(long = "db")]
    db_file: Option<PathBuf>,
    #[arg(long = "log-level", value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
    #[arg(long = "log-file", default_value = "")]
    log_file: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the tables and index if missing
    Init,
    /// List the registered scales
    Scales,
    /// Show one registered scale
    Scale { id: u32 },
    /// Register or replace a scale
    SaveScale {
        id: u32,
        data_perf_addr: i64,
        ip: String,
        rs485_addr: i64,
        fraction: String,
    },
    /// Remove a scale from the registry
    ClearScale { id: u32 },
    /// Dump the event log as delimited text
    Export {
        #[arg(long = "sep", default_value = ",")]
        sep: String,
        #[arg(long = "out")]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    //We have to keep the worker_guard alive
    let _worker_guard = init_logger(args.log_level, &args.log_file).unwrap_or_else(|e| {
        eprintln!("Couldn't init logging: {}", e);
        std::process::exit(1);
    });

    let mut config = match &args.config_file {
        Some(path) => StoreConfig::from_file(path).unwrap_or_else(|e| {
            error!("{:#}", e);
            std::process::exit(1);
        }),
        None => StoreConfig::default(),
    };

    if let Some(db_file) = args.db_file {
        config.db_file = db_file;
    }

    if let Err(err) = config.validate() {
        error!("Wrong config:\n{}", err);
        std::process::exit(1);
    }

    let store = Store::open(&config).unwrap_or_else(|e| {
        error!("Couldn't init db: {}", e);
        std::process::exit(1);
    });

    if let Err(err) = run(&store, args.command).await {
        error!("{:#}", err);
        std::process::exit(1);
    }
}

async fn run(store: &Store, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Init => {
            info!("Database ready");
        }
        Command::Scales => {
            for scale in store.read_scales()?.values() {
                print_scale(scale);
            }
        }
        Command::Scale { id } => match store.read_scale(id)? {
            Some(scale) => print_scale(&scale),
            None => info!("Scale {} is not registered", id),
        },
        Command::SaveScale {
            id,
            data_perf_addr,
            ip,
            rs485_addr,
            fraction,
        } => {
            store.save_scale(id, data_perf_addr, &ip, rs485_addr, &fraction)?;
            info!("Saved scale {}", id);
        }
        Command::ClearScale { id } => {
            store.clear_scale(id)?;
            info!("Cleared scale {}", id);
        }
        Command::Export { sep, out } => {
            let stream = store.export_data(&sep);
            let summary = match out {
                Some(path) => {
                    let mut file = std::io::BufWriter::new(std::fs::File::create(&path)?);
                    stream.write_to(&mut file).await?
                }
                None => stream.write_to(&mut std::io::stdout().lock()).await?,
            };
            info!("Exported {} lines", summary.sent);
        }
    }

    Ok(())
}

fn print_scale(scale: &Scale) {
    println!(
        "{}\t{}\trs485: {}\tdata perf: {}\tfraction: {}",
        scale.id, scale.ip, scale.rs485_addr, scale.data_perf_addr, scale.fraction
    );
}
