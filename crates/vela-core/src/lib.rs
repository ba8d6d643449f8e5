//! Shared, dependency-minimized core types used across Vela.

mod document;
mod features;
mod priority;
mod text;

pub use document::{DocumentKey, Revision};
pub use features::FeatureLevel;
pub use priority::Priority;
pub use text::{EditRangeSet, TextRange};
