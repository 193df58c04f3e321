//! Session replay pipeline
//!
//! Accepts raw PNG frames from the host, compresses them to JPEG, batches
//! them into `$snapshot` events and ships them to the capture endpoint.
//! Frames are never persisted; an inactive pipeline drops them silently.

mod encoder;
mod events;
mod pipeline;

pub use pipeline::ReplayPipeline;
