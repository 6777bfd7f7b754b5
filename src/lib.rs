pub mod error;
pub mod hnsw;
pub mod merge;
pub mod pq;
pub mod space;
pub mod stop_condition;
pub mod visited;

pub use error::Error;
pub use error::Result;
pub use hnsw::HnswIndex;
pub use pq::PqAdcSpace;
pub use pq::PqCodebook;
pub use pq::PqSdcSpace;
pub use space::InnerProductSpace;
pub use space::Int8InnerProductSpace;
pub use space::L2Space;
pub use space::Space;
pub use stop_condition::EpsilonSearchStopCondition;
pub use stop_condition::MultiVectorSearchStopCondition;
pub use stop_condition::SearchStopCondition;

pub type TableInt = u32; // Internal ID.
pub type LinkListSizeInt = u32;
pub type LabelType = u64; // External ID.
