//! # ess2bids
//!
//! Source side of the converter: reads a legacy ESS study (study description
//! XML, event instance files, recordings) and builds the project model that
//! `ess2bids_common` exports as a BIDS layout.

pub mod convert;
pub mod definitions;
pub mod description;
pub mod electrodes;
pub mod generator;
pub mod repair;

pub use convert::{convert_study, ConvertOptions};
pub use description::{Mode, StudyDescription};
pub use electrodes::{CachedExtractor, ChannelLayout, ElectrodeExtractor, ExternalEngine};
