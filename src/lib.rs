//! Persistence for industrial scale telemetry.
//!
//! The collector keeps a small registry of scales and an append-only log of
//! the events they report (accumulated weight, state changes, shift and
//! precision) in a local SQLite file, and streams that log back out for
//! reports and bulk export.
//!
//! Everything goes through [`data::Store`]:
//!
//! - registry: [`Store::save_scale`], [`Store::clear_scale`],
//!   [`Store::read_scales`], [`Store::save_scale_fraction`]
//! - event log: [`Store::save_event`] and the duplicate-write guard
//!   [`Store::periodic_save`], which collapses a device event reported twice
//!   in a row into one row
//! - exports: [`Store::export_data`], [`Store::export_data_struct`],
//!   [`Store::export_data_struct_any_time`]
//!
//! Write operations log their failures and also return them, callers on the
//! polling path are free to ignore the result.

pub mod common;
pub mod config;
pub mod data;
pub mod error;

pub use config::StoreConfig;
pub use data::{DataRecord, EventPayload, ExportStream, ExportSummary, GuardOutcome, Scale, Store};
pub use error::StoreError;
