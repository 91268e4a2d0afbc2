//! Application shell.
//!
//! Wires the pieces together: logging, config, signal handling, the
//! process lock, and finally the bidirectional supervisor. Library
//! users call `run` with their data handler and let the shell own the
//! process lifecycle.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use reqwest::header::HeaderMap;

use crate::client::{FeedClient, JsonDecoder};
use crate::config::CrawlerConfig;
use crate::crawler::{CrawlerContext, DataHandler};
use crate::lock;
use crate::position::DateModifiedLatch;
use crate::run_flag::RunFlag;
use crate::store::Store;
use crate::supervisor;

/// One-shot setup future awaited before crawling starts (schema
/// migrations, cache warm-up and the like).
pub type InitTask = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Caller-side knobs for one crawler run.
#[derive(Default)]
pub struct RunOptions {
    /// Resource path override (defaults to `API_RESOURCE`).
    pub resource: Option<String>,
    /// `opt_fields` override (defaults to `API_OPT_FIELDS`).
    pub opt_fields: Option<Vec<String>>,
    /// Extra default headers merged over the built-in ones.
    pub additional_headers: Option<HeaderMap>,
    pub init_task: Option<InitTask>,
    /// Custom feed page decoder.
    pub decoder: Option<JsonDecoder>,
}

/// Structured JSON logs on stdout, filtered by `RUST_LOG` (info when
/// unset). Safe to call more than once.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .try_init();
}

/// Full process lifecycle: read config, install signal handlers, hold
/// the process lock while the supervisor runs, drain on SIGINT/SIGTERM.
pub async fn run(handler: Arc<dyn DataHandler>, options: RunOptions) -> Result<()> {
    init_logging();
    let config = CrawlerConfig::from_env()?;
    let flag = RunFlag::new();
    install_signal_handlers(&flag);

    lock::run_locked(&config, &flag, || {
        run_app(config.clone(), handler, options, flag.clone())
    })
    .await
}

/// Run the crawler with an explicit config and stop flag. The lock, if
/// any, is the caller's business.
pub async fn run_app(
    config: CrawlerConfig,
    handler: Arc<dyn DataHandler>,
    options: RunOptions,
    flag: RunFlag,
) -> Result<()> {
    let config = config.with_overrides(options.resource.as_deref(), options.opt_fields.as_deref());

    if let Some(init_task) = options.init_task {
        init_task.await?;
    }

    let store = Arc::new(Store::from_config(&config).await?);
    let client = Arc::new(FeedClient::new(
        &config.api,
        &config.api.resource,
        options.additional_headers,
        options.decoder,
    )?);

    let ctx = CrawlerContext {
        client,
        store: store.clone(),
        handler,
        config: Arc::new(config),
        flag,
        latch: DateModifiedLatch::new(),
    };
    let result = supervisor::init_crawler(&ctx).await;
    store.close().await;
    result
}

fn install_signal_handlers(flag: &RunFlag) {
    use tokio::signal::unix::{signal, SignalKind};

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let flag = flag.clone();
        tokio::spawn(async move {
            let mut stream = match signal(kind) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!("failed to install {} handler: {}", name, e);
                    return;
                }
            };
            stream.recv().await;
            tracing::warn!(
                message_id = "HANDLE_STOP_SIG",
                signal = name,
                "Handling {} signal: stopping crawlers",
                name
            );
            flag.stop();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::DataHandler;
    use async_trait::async_trait;
    use serde_json::Value;

    struct NoopHandler;

    #[async_trait]
    impl DataHandler for NoopHandler {
        async fn handle(&self, _session: &FeedClient, _items: &[Value]) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_app_refuses_without_a_backend() {
        let config = CrawlerConfig::test_default();
        let result = run_app(
            config,
            Arc::new(NoopHandler),
            RunOptions::default(),
            RunFlag::new(),
        )
        .await;

        let message = result.unwrap_err().to_string();
        assert!(message.contains("MONGODB_URL"), "got: {}", message);
    }

    #[tokio::test]
    async fn test_run_app_runs_failed_init_task_first() {
        let config = CrawlerConfig::test_default();
        let options = RunOptions {
            init_task: Some(Box::pin(async { anyhow::bail!("migration failed") })),
            ..Default::default()
        };
        let result = run_app(config, Arc::new(NoopHandler), options, RunFlag::new()).await;

        let message = result.unwrap_err().to_string();
        assert!(message.contains("migration failed"), "got: {}", message);
    }

    #[test]
    fn test_options_default_to_env_config() {
        let options = RunOptions::default();
        assert!(options.resource.is_none());
        assert!(options.opt_fields.is_none());
        assert!(options.additional_headers.is_none());
    }
}
