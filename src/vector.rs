//! Embedding primitives shared by every other module.
//!
//! # Module Structure
//!
//! - `embedding`: immutable, fixed-dimension embedding values
//! - `distance`: distance metrics used for projection and exact rerank
//! - `simd`: `wide`-accelerated kernels behind the metrics
//! - `pool`: dimension-sized scratch buffer pool used by aggregators

pub mod distance;
pub mod embedding;
pub mod pool;
pub mod simd;

pub use self::distance::DistanceMetric;
pub use self::embedding::Embedding;
pub use self::pool::VectorPool;
