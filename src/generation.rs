//! Generation by repeated retrieval and attention.
//!
//! # Module Structure
//!
//! - `encoder`: window -> query encoders (centroid, recency decay)
//! - `generator`: the step loop over a bounded sliding window

pub mod encoder;
pub mod generator;

pub use self::encoder::{CentroidContextEncoder, ContextEncoder, DecayContextEncoder};
pub use self::generator::{GenerationStep, Generator};
