//! Camera-side plumbing: readout events, image acquisition, source extraction
//!
//! - `event` - exposure-completion events and header access
//! - `subscription` - JSON-lines event source feeding a `ReadoutHandler`
//! - `resolver` - local path or HTTP fetch into the storage directory
//! - `extractor` - external source-detection tool adapter

pub mod event;
pub mod extractor;
pub mod resolver;
pub mod subscription;

pub use event::{ExposureEvent, HeaderValue, ReadoutStatus};
pub use extractor::{ExtractionError, ExtractorParams, SExtractor, SourceExtractor};
pub use resolver::{HttpImageFetcher, ImageFetcher, ImageResolver, ImageRetrievalError, ResolvedImage};
pub use subscription::{run_event_source, ReadoutHandler, SubscriptionStats};
