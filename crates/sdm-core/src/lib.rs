//! Data model shared by the trial runner: covariate rasters, point
//! observations, their envelopes, and the run error taxonomy.

pub mod covariates;
pub mod envelope;
pub mod error;
pub mod fsutil;
pub mod observations;

pub use covariates::{CovariateImage, CovariateProvider, CovariateSet};
pub use envelope::Envelope;
pub use error::{Result, SdmError};
pub use fsutil::{atomic_write_bytes, atomic_write_json_pretty, ensure_dir, sha256_bytes, sha256_file};
pub use observations::{Observation, ObservationProvider, ObservationSet, DEFAULT_SRS};
