//! tps2sqlite converts legacy TopSpeed database files (`.tps`, `.phd`,
//! `.mod`) into a relational SQLite database.
//!
//! The crate is the conversion core only: a page-oriented binary reader,
//! a table-definition parser with tolerant fallbacks, an array analyzer,
//! a schema projector and a streaming engine that batches inserts under a
//! memory governor.  The end-user CLI, progress reporting and `.phz`
//! (zip) unpacking live with the caller; a `.phz` archive yields ordinary
//! `.phd`/`.mod` files which this crate then consumes.
//!
//! ```no_run
//! use std::path::{Path, PathBuf};
//!
//! fn main() -> anyhow::Result<()> {
//!     let sources = vec![PathBuf::from("sample.phd"), PathBuf::from("sample.mod")];
//!     let report = tps2sqlite::convert(
//!         &sources,
//!         Path::new("sample.sqlite"),
//!         tps2sqlite::Config::default(),
//!     )?;
//!     println!("{} rows in {} tables", report.rows_written, report.tables_ok);
//!     Ok(())
//! }
//! ```

pub mod arrays;
pub mod codepage;
pub mod config;
pub mod dbheader;
pub mod decoder;
pub mod engine;
pub mod governor;
pub mod pager;
pub mod record;
pub mod schema;
pub mod table_def;
pub mod value;

pub use config::{Config, OnRowError, Profile};
pub use engine::{convert, CancelToken, ConversionEngine, ConversionReport, TableStatus};
pub use value::Value;
