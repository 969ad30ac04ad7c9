// Off-thread slice stitching and color mapping
// The worker thread talks to the async side only through the protocol messages

pub mod protocol;
pub mod worker;
pub mod result_cache;
pub mod slice_pipeline;

pub use protocol::{StitchJob, WorkerRequest, WorkerResponse};
pub use worker::spawn_worker;
pub use result_cache::SliceResultCache;
pub use slice_pipeline::{PipelineStats, SlicePipeline};
