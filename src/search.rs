//! Multi-resolution nearest-neighbor search.
//!
//! # Module Structure
//!
//! - `filter`: metadata predicates
//! - `funnel`: the coarse -> fine -> exact pipeline
//! - `result`: requests, hits, status and per-stage stats

pub mod filter;
pub mod funnel;
pub mod result;

pub use self::filter::MetadataFilter;
pub use self::funnel::MultiResolutionSearch;
pub use self::result::{
    FunnelStats, SearchHit, SearchRequest, SearchResults, SearchStage, SearchStatus,
};
