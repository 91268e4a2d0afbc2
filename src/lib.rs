//! Resumable bidirectional changes-feed crawler.
//!
//! Consumes a paginated change stream in both directions at once: the
//! forward loop tails new changes while the backward loop drains
//! history. Page cursors are persisted after every handled page, so a
//! restarted process resumes exactly where it stopped, and a TTL-based
//! process lock keeps deployments down to one live crawler.
//!
//! Callers plug in a [`DataHandler`] and call [`run`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use feed_crawler::{run, DataHandler, FeedClient, RunOptions};
//! use serde_json::Value;
//!
//! struct PrintingHandler;
//!
//! #[async_trait]
//! impl DataHandler for PrintingHandler {
//!     async fn handle(&self, _session: &FeedClient, items: &[Value]) -> anyhow::Result<()> {
//!         for item in items {
//!             tracing::info!("Processing {}", item["id"]);
//!         }
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     run(Arc::new(PrintingHandler), RunOptions::default()).await
//! }
//! ```

pub mod app;
pub mod client;
pub mod config;
pub mod crawler;
pub mod lock;
pub mod offset;
pub mod position;
pub mod resource;
pub mod run_flag;
pub mod store;
pub mod supervisor;

pub use app::{init_logging, run, run_app, InitTask, RunOptions};
pub use client::{FeedClient, FeedPage, FeedParams, FeedResponse, FeedResult, JsonDecoder};
pub use config::CrawlerConfig;
pub use crawler::{crawl, BackwardStop, CrawlerContext, DataHandler};
pub use lock::{run_locked, ProcessLock};
pub use offset::Direction;
pub use position::{DateModifiedLatch, PositionPatch};
pub use resource::{get_response_data, process_resource};
pub use run_flag::RunFlag;
pub use store::{FeedPosition, Store, StoreError};
pub use supervisor::{init_crawler, init_feed};
