//! Storage and maintenance core for a meteorological data archive.
//!
//! This crate implements the four tightly coupled subsystems of a dataset:
//! a [`segment`] store grouping messages into time-partitioned on-disk
//! units, an [`index`] mapping message fingerprints to their storage
//! location and scalar metadata, a [`maintenance`] engine that classifies
//! and repairs the on-disk/index pairing, and an [`archive`] layer that
//! moves aged segments into a secondary read-mostly tier.
//!
//! [`writer::Writer`] and [`reader::Reader`] are the two client-facing
//! entry points; everything else is a collaborator they (or maintenance)
//! drive. Decoding the real GRIB1/GRIB2/BUFR/ODIM/VM2 binary formats, the
//! matcher expression language, and the HTTP/CLI front-ends beyond the
//! thin [`cli`] surface are explicitly out of scope — see [`scanner`] for
//! the trait boundary a real decoder plugs into.

pub mod archive;
pub mod cli;
pub mod config;
pub mod envelope;
pub mod error;
pub mod index;
pub mod lock;
pub mod maintenance;
pub mod metadata;
pub mod postprocess;
pub mod reader;
pub mod reftime;
pub mod scanner;
pub mod segment;
pub mod summary;
pub mod value;
pub mod writer;

pub use config::DatasetConfig;
pub use error::{ArkError, Result};
pub use metadata::{Fingerprint, Format, Message, Metadata};
pub use reader::Reader;
pub use writer::Writer;
