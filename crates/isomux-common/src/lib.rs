//! Shared types for the isomux workspace.
//!
//! This crate holds the pieces every other crate needs: the error type,
//! the `Sample` model that flows from the elementary-stream parsers into
//! the muxer, the run-length and `(index, dts)` containers the sample
//! tables are built from, and small value types (`FourCc`, `StreamKind`,
//! `DsiEntry`).

pub mod error;
pub mod list;
pub mod sample;
pub mod types;

pub use error::{Error, Result};
pub use list::{CountValueList, Cursor, IndexDts, IndexDtsList, Run, RunCursor};
pub use sample::{AuxData, Dependency, Sample, SampleFlags};
pub use types::{DsiEntry, FourCc, StreamInfo, StreamKind};
