//! Services - event-time aggregation logic
//!
//! - `normalizer` - Raw payload to typed `TransactionEvent`
//! - `window` - Tumbling window assignment
//! - `watermark` - Per-key watermark clock
//! - `accumulator_store` - Worker partials and reducer-owned window state
//! - `pipeline` - Worker and reducer tasks wiring it all together

pub mod accumulator_store;
pub mod normalizer;
pub mod pipeline;
pub mod watermark;
pub mod window;

// Re-export commonly used types
pub use accumulator_store::{PartialStore, WindowState, WindowStore};
pub use normalizer::{normalize, NormalizeError};
pub use pipeline::{spawn_pipeline, Pipeline};
pub use watermark::{WatermarkClock, WatermarkPolicy};
pub use window::TumblingWindower;
