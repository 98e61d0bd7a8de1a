//! Realtime feed plumbing: HTTP fetching with retry/backoff, protobuf
//! decoding, and normalization into the canonical event model.

pub mod decode;
pub mod error;
pub mod feeds;
pub mod fetch;
pub mod gtfs;

pub use decode::{decode_feed, normalize, DecodeOutcome};
pub use error::{DecodeError, FetchError};
pub use feeds::{feed_descriptors, feed_for_route, routes_for_feed, FeedDescriptor};
pub use fetch::Fetcher;
