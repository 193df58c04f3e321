//! # posthog-agent
//!
//! Client-side analytics agent: ingests application events and screen-capture
//! snapshots from a host application, persists them durably across process
//! restarts, and ships them in batches to a remote ingestion service.
//!
//! This library provides:
//! - A durable, FIFO event queue backed by SQLite
//! - Batch delivery with periodic and size-triggered flushing
//! - A session-replay pipeline (PNG → JPEG → `$snapshot` events)
//! - A feature-flag cache with on-demand refresh
//! - Persistent identity and preference settings
//!
//! ## Example
//!
//! ```rust,no_run
//! use posthog_agent::{Agent, AgentConfig};
//!
//! let agent = Agent::setup(AgentConfig {
//!     api_key: "phc_example".to_string(),
//!     ..Default::default()
//! })
//! .expect("failed to initialize agent");
//!
//! agent.capture("app_opened", None);
//! agent.close();
//! ```

// Re-export commonly used items at the crate root
pub use agent::Agent;
pub use config::{AgentConfig, SessionReplayConfig};
pub use error::{Error, Result};
pub use event::Event;
pub use flags::{FlagCache, FlagValue};
pub use replay::ReplayPipeline;
pub use store::Store;
pub use transport::{Transport, TransportResponse};

// Public modules
pub mod agent;
pub mod config;
pub mod error;
pub mod event;
pub mod flags;
pub mod logging;
pub mod replay;
pub mod store;
pub mod transport;
