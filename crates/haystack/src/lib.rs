//! Haystack - tag-based building-automation data exchange
//!
//! Scalar values with unit-aware text encodings, and a server-side watch
//! mechanism for tracking live changes to a working set of records.
//!
//! ## Quick Start
//!
//! ```ignore
//! use haystack::{Dispatcher, MemoryBackend, Num, Ref, dict};
//!
//! let backend = MemoryBackend::new();
//! backend.commit(dict! { "id" => Ref::new("ahu1")?, "dis" => "AHU-1" })?;
//!
//! let server = Dispatcher::new(backend);
//! let watch = server.watch_open("dashboard", Some(Num::with_unit(5.0, "min")?))?;
//!
//! // Current state of the records, plus watchId/lease meta
//! let grid = watch.sub(&[Ref::new("ahu1")?], true)?;
//!
//! // Later: only what changed since the last poll
//! let changes = watch.poll_changes()?;
//! ```
//!
//! ## Scalar encodings
//!
//! - Plain: `72.5 kW`, `INF`, `-INF`, `NaN`
//! - Tagged: `n:72.5kW`
//! - Numbers carry at most 4 fractional digits, trailing zeros dropped

mod grid;
mod memory;
mod num;
mod parse;
mod server;
mod store;
mod val;
mod watch;

use thiserror::Error;

// ============ Primary Public API ============

pub use grid::{Col, Grid, Row};
pub use memory::{MemoryBackend, WRITE_LEVELS};
pub use num::{Num, NumFormat, is_unit_name};
pub use parse::ParseError;
pub use server::{Backend, Dispatcher, DispatcherConfig, HisItem, HisRange};
pub use store::{MemoryStore, Record, RecordStore};
pub use val::{Dict, Ref, Val};
pub use watch::{StoreWatch, Watch, WatchIds};

// ============ Errors ============

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HaystackError {
    #[error("Invalid unit name: {0}")]
    InvalidUnit(String),

    #[error("Invalid ref id: {0}")]
    InvalidRef(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid duration unit: {}", .0.as_deref().unwrap_or("null"))]
    NotDuration(Option<String>),

    #[error("Watch is closed")]
    WatchClosed,

    #[error("Unknown record: {0}")]
    UnknownRecord(Ref),

    #[error("Unknown watch: {0}")]
    UnknownWatch(String),

    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
}

/// Coarse classification of a [`HaystackError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input rejected before anything was stored
    InvalidArgument,
    /// Operation does not apply to the value (e.g. duration of `kg`)
    InvalidOperation,
    /// Operation on a watch that is not open
    InvalidState,
    UnknownRecord,
    UnknownWatch,
    /// Extension point the deployment does not provide
    NotImplemented,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalidArgument",
            Self::InvalidOperation => "invalidOperation",
            Self::InvalidState => "invalidState",
            Self::UnknownRecord => "unknownRecord",
            Self::UnknownWatch => "unknownWatch",
            Self::NotImplemented => "notImplemented",
        }
    }
}

impl HaystackError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidUnit(_) | Self::InvalidRef(_) | Self::InvalidArgument(_) => {
                ErrorKind::InvalidArgument
            }
            Self::Parse(_) => ErrorKind::InvalidArgument,
            Self::NotDuration(_) => ErrorKind::InvalidOperation,
            Self::WatchClosed => ErrorKind::InvalidState,
            Self::UnknownRecord(_) => ErrorKind::UnknownRecord,
            Self::UnknownWatch(_) => ErrorKind::UnknownWatch,
            Self::NotImplemented(_) => ErrorKind::NotImplemented,
        }
    }
}

pub type Result<T> = std::result::Result<T, HaystackError>;
