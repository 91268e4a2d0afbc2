//! Per-direction crawl loop.
//!
//! Each iteration fetches one feed page, classifies the outcome, hands
//! non-empty pages to the data handler, persists the new cursor, and
//! sleeps the fixed interval the outcome calls for. The backward loop
//! stops when history runs dry (or reaches the date-modified barrier);
//! the forward loop only ever terminates on an invalidated cursor.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde_json::Value;

use crate::client::{FeedClient, FeedPage, FeedParams, FeedResult};
use crate::config::CrawlerConfig;
use crate::offset::{offset_age_now, Direction};
use crate::position::{build_patch, derived_date_modified, DateModifiedLatch, PositionPatch};
use crate::run_flag::RunFlag;
use crate::store::Store;

/// Capability invoked once per non-empty feed page (and once on the
/// bootstrap page). The items' schema is the handler's business; the
/// crawler only promises page ordering within a direction.
///
/// ```no_run
/// use async_trait::async_trait;
/// use feed_crawler::{DataHandler, FeedClient};
/// use serde_json::Value;
///
/// struct LoggingHandler;
///
/// #[async_trait]
/// impl DataHandler for LoggingHandler {
///     async fn handle(&self, _session: &FeedClient, items: &[Value]) -> anyhow::Result<()> {
///         for item in items {
///             tracing::info!("Processing {}", item["id"]);
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait DataHandler: Send + Sync {
    async fn handle(&self, session: &FeedClient, items: &[Value]) -> Result<()>;
}

/// Everything one crawl direction needs, shared with its sibling.
pub struct CrawlerContext {
    pub client: Arc<FeedClient>,
    pub store: Arc<Store>,
    pub handler: Arc<dyn DataHandler>,
    pub config: Arc<CrawlerConfig>,
    pub flag: RunFlag,
    pub latch: DateModifiedLatch,
}

/// Backward-loop stop parameters. Forward loops pass the default.
#[derive(Debug, Default, Clone)]
pub struct BackwardStop {
    /// Snapshot of the persisted `latest_date_modified` at launch.
    pub barrier: Option<DateTime<FixedOffset>>,
    /// The initial backward offset came from the operator, so the spot
    /// where history ran dry must be recorded before stopping.
    pub explicit_start: bool,
}

pub async fn crawl(
    ctx: &CrawlerContext,
    direction: Direction,
    initial_offset: String,
    backward: BackwardStop,
) -> Result<()> {
    let retry = &ctx.config.retry;
    let feed_url = ctx.client.feed_url().to_string();
    let mut params = FeedParams::new(&ctx.config.api, direction, initial_offset);
    tracing::info!(
        message_id = "CRAWLER_STARTED",
        feed_url = %feed_url,
        descending = params.descending,
        offset = %params.offset,
        "Crawler started"
    );

    while ctx.flag.should_run() {
        if direction == Direction::Forward && ctx.config.forward_cooldown.enabled() {
            match offset_age_now(&params.offset) {
                None => {
                    tracing::error!(
                        message_id = "INVALID_OFFSET",
                        offset = %params.offset,
                        "Forward offset has no timestamp prefix, cooldown skipped"
                    );
                }
                Some(age) if age < ctx.config.forward_cooldown.cooldown.as_secs() as i64 => {
                    tokio::time::sleep(ctx.config.forward_cooldown.sleep).await;
                    continue;
                }
                Some(_) => {}
            }
        }

        tracing::debug!(
            message_id = "FEED_REQUEST",
            feed_url = %feed_url,
            descending = params.descending,
            offset = %params.offset,
            "Feed request"
        );
        match ctx.client.get_feed(&params).await {
            FeedResult::TransientNet(e) => {
                tracing::warn!(
                    message_id = "HTTP_EXCEPTION",
                    feed_url = %feed_url,
                    "Crawler exception: {}",
                    e
                );
                tokio::time::sleep(retry.connection_error).await;
                continue;
            }
            FeedResult::TooManyRequests => {
                tracing::warn!(
                    message_id = "TOO_MANY_REQUESTS",
                    feed_url = %feed_url,
                    "Too many requests while getting feed"
                );
                tokio::time::sleep(retry.too_many_requests).await;
            }
            FeedResult::PreconditionFailed => {
                tracing::warn!(
                    message_id = "PRECONDITION_FAILED",
                    feed_url = %feed_url,
                    "Precondition failed"
                );
            }
            FeedResult::OffsetInvalid => {
                tracing::error!(
                    message_id = "OFFSET_INVALID",
                    feed_url = %feed_url,
                    "Offset expired/invalid"
                );
                ctx.store.drop_position().await;
                tracing::info!(
                    message_id = "CRAWLER_DROP_FEED_POSITION",
                    feed_url = %feed_url,
                    "Dropped feed position"
                );
                if ctx.config.date_modified_lock.enabled {
                    match ctx.store.lock_date_modified().await {
                        Ok(()) => {
                            ctx.latch.engage();
                            tracing::info!(
                                message_id = "CRAWLER_LOCK_DATE_MODIFIED",
                                "Date-modified tracking latched until history is re-verified"
                            );
                        }
                        Err(e) => tracing::error!("{}", e),
                    }
                }
                break;
            }
            FeedResult::UnexpectedStatus(status, body) => {
                tracing::error!(
                    message_id = "FEED_UNEXPECTED_ERROR",
                    feed_url = %feed_url,
                    status,
                    body = %body,
                    "Crawler request error"
                );
            }
            FeedResult::Page(page) => {
                if !page.data.is_empty() {
                    ctx.handler.handle(&ctx.client, &page.data).await?;
                    save_page_position(ctx, direction, &page).await;
                }

                if direction == Direction::Backward {
                    if page.data.is_empty() {
                        if backward.explicit_start {
                            let patch = PositionPatch {
                                backward_offset: Some(page.next_offset.clone()),
                                server_id: ctx.client.server_id(),
                                ..Default::default()
                            };
                            ctx.store.save(&patch).await;
                        }
                        tracing::info!(
                            message_id = "BACK_CRAWLER_STOP",
                            feed_url = %feed_url,
                            "Stop backward crawling"
                        );
                        break;
                    }
                    if barrier_reached(ctx, &page, backward.barrier) {
                        match ctx.store.unlock_date_modified().await {
                            Ok(()) => {
                                ctx.latch.clear();
                                tracing::info!(
                                    message_id = "CRAWLER_UNLOCK_DATE_MODIFIED",
                                    "Date-modified tracking resumed"
                                );
                            }
                            Err(e) => tracing::error!("{}", e),
                        }
                        tracing::info!(
                            message_id = "CRAWLER_DATE_MODIFIED_REACHED",
                            feed_url = %feed_url,
                            "Backward crawler reached already-covered history"
                        );
                        break;
                    }
                }

                params.offset = page.next_offset;
                if page.data.len() < params.limit as usize {
                    tokio::time::sleep(retry.no_items).await;
                }
            }
        }
        tokio::time::sleep(retry.feed_step).await;
    }

    tracing::info!(
        message_id = "CRAWLER_STOPPED",
        feed_url = %feed_url,
        descending = params.descending,
        offset = %params.offset,
        "Crawler stopped"
    );
    Ok(())
}

async fn save_page_position(ctx: &CrawlerContext, direction: Direction, page: &FeedPage) {
    let latched = ctx.config.date_modified_lock.enabled && ctx.latch.is_set();
    let patch = build_patch(
        direction,
        &page.next_offset,
        &page.data,
        ctx.client.server_id(),
        latched,
        &ctx.config.date_modified_lock.skip_statuses,
    );
    ctx.store.save(&patch).await;
}

/// Backward stop barrier: the page's derived date-modified fell
/// strictly below `latest_date_modified - margin`, so everything older
/// was already covered by a previous run.
fn barrier_reached(
    ctx: &CrawlerContext,
    page: &FeedPage,
    barrier: Option<DateTime<FixedOffset>>,
) -> bool {
    if !ctx.config.date_modified_lock.enabled {
        return false;
    }
    let Some(barrier) = barrier else {
        return false;
    };
    let Some(raw) = derived_date_modified(&page.data, &ctx.config.date_modified_lock.skip_statuses)
    else {
        return false;
    };
    let Some(page_dm) = parse_date_modified(raw) else {
        return false;
    };
    page_dm < barrier - chrono::Duration::seconds(ctx.config.date_modified_lock.margin_seconds)
}

pub fn parse_date_modified(raw: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(raw).ok()
}
