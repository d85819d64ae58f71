pub mod augment;
pub mod backbone;
pub mod config;
pub mod data;
pub mod encoder;
pub mod error;
pub mod inference;
pub mod model;
pub mod plot;
pub mod record;
pub mod report;
pub mod split;
pub mod training;

/// Activity classes kept from the dataset; any other directory is ignored.
pub const LABELS: [&str; 2] = ["cooking", "drinking"];
