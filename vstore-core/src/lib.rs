//! VStore Core Library
//!
//! Versioned per-user object storage:
//! - Version file codec (whole and diff layouts)
//! - Diff reconstruction across base-version chains
//! - Object status ledger and space quota tracking
//! - Directory leases and write transactions
//! - Lazy, chunked readers over object versions

pub mod config;
pub mod diff;
pub mod error;
pub mod lease;
pub mod obj_file;
pub mod reader;
pub mod registry;
pub mod space;
pub mod status;
pub mod store;
pub mod transaction;

pub use config::StoreConfig;
pub use diff::{locate_window, PhysicalRead, Window};
pub use error::{FormatError, Result, StoreError};
pub use obj_file::{DiffInfo, FileLayout, Section, SectionTag};
pub use reader::{ObjReader, ReadRequest, SegsSource};
pub use registry::StoreRegistry;
pub use space::{SpaceInfo, SpaceTracker};
pub use status::{ObjState, ObjectStatus};
pub use store::Store;
pub use transaction::{ObjSizes, TransactionParams, TransactionRecord, TransactionType};
