//! Hand-rolled model internals: isolation forest and a dense reconstruction
//! autoencoder. Kept dependency-free so artifacts stay portable across
//! versions.

pub mod autoencoder;
pub mod iforest;

pub use autoencoder::Autoencoder;
pub use iforest::IsolationForest;
