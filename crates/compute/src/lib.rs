//! Feature derivation and anomaly detection.
//!
//! The feature engine turns canonical trip records into [`FeatureFrame`]s
//! over sharded sliding windows; the detector scores frames with an
//! isolation forest and per-line sequences with a reconstruction
//! autoencoder. Everything here is synchronous pure computation — I/O stays
//! in the server's scheduler.
//!
//! [`FeatureFrame`]: headway_core::FeatureFrame

pub mod algorithms;
pub mod detect;
pub mod error;
pub mod features;
pub mod stats;
pub mod train;

pub use detect::{Detector, ModelState, ScoreDecision, ScoreOutcome};
pub use error::ComputeError;
pub use features::{FeatureEngine, FrameVector};
pub use train::{fit_outlier_model, fit_sequence_model, OutlierModel, SequenceModel};
