//! Bidirectional supervisor.
//!
//! Restores offsets from the position store (or the operator, or a
//! probe of the feed head), then runs the forward and backward crawl
//! loops concurrently. The backward loop ending is final for the
//! session; the forward loop ending means the cursor was invalidated,
//! so the whole bootstrap runs again.

use anyhow::Result;

use crate::client::{FeedParams, FeedResult};
use crate::crawler::{crawl, parse_date_modified, BackwardStop, CrawlerContext};
use crate::offset::Direction;

pub async fn init_crawler(ctx: &CrawlerContext) -> Result<()> {
    let feed_url = ctx.client.feed_url().to_string();
    tracing::info!(message_id = "START_CRAWLING", feed_url = %feed_url, "Start crawling");

    while ctx.flag.should_run() {
        let position = ctx.store.get().await;

        // Whatever bootstrap path wins, the latch and the backward stop
        // barrier come from the persisted record.
        ctx.latch
            .seed(position.as_ref().and_then(|p| p.lock_date_modified).unwrap_or(false));
        let barrier = position
            .as_ref()
            .and_then(|p| p.latest_date_modified.as_deref())
            .and_then(parse_date_modified);

        let (forward_offset, backward_offset, explicit_start) =
            if let Some((forward, backward)) = position.as_ref().and_then(|p| p.both_offsets()) {
                tracing::info!(
                    message_id = "LOAD_CRAWLER_POSITION",
                    feed_url = %feed_url,
                    forward_offset = %forward,
                    backward_offset = %backward,
                    "Start from saved position"
                );
                if let Some(server_id) = position.as_ref().and_then(|p| p.server_id.as_deref()) {
                    ctx.client.set_server_id(server_id);
                }
                (forward, backward, false)
            } else if let Some((forward, backward)) = ctx.config.bootstrap.both() {
                tracing::info!(
                    message_id = "LOAD_CRAWLER_POSITION",
                    feed_url = %feed_url,
                    forward_offset = %forward,
                    backward_offset = %backward,
                    "Start from operator-supplied offsets"
                );
                (forward, backward, true)
            } else {
                match init_feed(ctx).await? {
                    Some((backward, forward)) => (forward, backward, false),
                    // stop flag fired mid-bootstrap
                    None => break,
                }
            };

        let forward = crawl(ctx, Direction::Forward, forward_offset, BackwardStop::default());
        let backward = crawl(
            ctx,
            Direction::Backward,
            backward_offset,
            BackwardStop {
                barrier,
                explicit_start,
            },
        );
        let (forward_result, backward_result) = tokio::join!(forward, backward);
        forward_result?;
        backward_result?;
    }
    Ok(())
}

/// Probe the descending head of the feed for the two initial offsets.
/// Hands the head page to the handler so the bootstrap page is covered,
/// but persists nothing. Returns `(backward, forward)`, or `None` when
/// the stop flag fired first.
pub async fn init_feed(ctx: &CrawlerContext) -> Result<Option<(String, String)>> {
    let feed_url = ctx.client.feed_url().to_string();
    tracing::info!(message_id = "CRAWLER_INIT", feed_url = %feed_url, "Crawler initialization");

    let params = FeedParams::new(&ctx.config.api, Direction::Backward, String::new());
    while ctx.flag.should_run() {
        match ctx.client.get_feed(&params).await {
            FeedResult::Page(page) => {
                ctx.handler.handle(&ctx.client, &page.data).await?;
                return Ok(Some((page.next_offset, page.prev_offset)));
            }
            FeedResult::TransientNet(e) => {
                tracing::warn!(
                    message_id = "HTTP_EXCEPTION",
                    feed_url = %feed_url,
                    "Init feed exception: {}",
                    e
                );
                tokio::time::sleep(ctx.config.retry.connection_error).await;
            }
            other => {
                tracing::error!(
                    message_id = "FEED_ERROR",
                    feed_url = %feed_url,
                    response = ?other,
                    "Error on feed initialize request"
                );
                tokio::time::sleep(ctx.config.retry.feed_step).await;
            }
        }
    }
    Ok(None)
}
