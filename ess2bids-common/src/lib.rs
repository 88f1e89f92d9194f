//! # ess2bids common library
//!
//! Layout-side code shared by the converter and the finalizer:
//! - Hierarchical field store and consolidation
//! - Project data model
//! - BIDS importer and exporter/merger (archiving, changesets)
//! - Field-replacement workflow and task rename
//! - Configuration loading

pub mod archive;
pub mod config;
pub mod consolidate;
pub mod error;
pub mod export;
pub mod field_store;
pub mod import;
pub mod layout;
pub mod patch;
pub mod project;
pub mod report;
pub mod tabular;
pub mod validator;

pub use error::{Error, Result};
pub use field_store::{FieldStore, Fields, Scope};
pub use project::Project;
