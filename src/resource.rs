//! Single-resource fetch with the feed's retry discipline.
//!
//! `GET {base}/{resource}/{id}` wrapped so handlers can hydrate items
//! from their feed envelope. Transport problems and 429 retry forever;
//! a missing resource is final; other failures get a bounded number of
//! retries and then resolve as "no data" rather than an error.

use std::future::Future;

use anyhow::Result;
use serde_json::Value;

use crate::client::FeedClient;
use crate::config::RetryPolicy;

/// Fetch one resource and run `process` on its `data` payload. Returns
/// `Ok(None)` when the fetch surrendered.
pub async fn process_resource<T, F, Fut>(
    client: &FeedClient,
    resource_url: &str,
    resource_id: &str,
    retry: &RetryPolicy,
    process: F,
) -> Result<Option<T>>
where
    F: FnOnce(&FeedClient, Value) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let url = format!("{}/{}", resource_url, resource_id);
    match get_response_data(client, &url, retry).await {
        Some(data) => Ok(Some(process(client, data).await?)),
        None => Ok(None),
    }
}

/// GET a JSON document and return its `data` member.
pub async fn get_response_data(
    client: &FeedClient,
    url: &str,
    retry: &RetryPolicy,
) -> Option<Value> {
    let mut error_retries = retry.get_error_retries;
    loop {
        let response = match client.http().get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(message_id = "HTTP_EXCEPTION", url, "Error from {}: {}", url, e);
                tokio::time::sleep(retry.connection_error).await;
                continue;
            }
        };

        match response.status().as_u16() {
            200..=299 => {
                let body = match response.bytes().await {
                    Ok(b) => b,
                    Err(e) => {
                        tracing::warn!(message_id = "HTTP_EXCEPTION", url, "{}", e);
                        tokio::time::sleep(retry.connection_error).await;
                        continue;
                    }
                };
                match serde_json::from_slice::<Value>(&body) {
                    Ok(mut decoded) => return Some(decoded.get_mut("data")?.take()),
                    Err(e) => {
                        tracing::warn!(message_id = "HTTP_EXCEPTION", url, "{}", e);
                        tokio::time::sleep(retry.connection_error).await;
                    }
                }
            }
            429 => {
                tracing::warn!(
                    message_id = "TOO_MANY_REQUESTS",
                    url,
                    "Too many requests while getting resource"
                );
                tokio::time::sleep(retry.too_many_requests).await;
            }
            404 => {
                let body = response.text().await.unwrap_or_default();
                tracing::error!(
                    message_id = "REQUEST_UNEXPECTED_ERROR",
                    url,
                    "Resource not found: 404 {}",
                    body
                );
                return None;
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                if error_retries > 1 {
                    tracing::warn!(
                        message_id = "REQUEST_UNEXPECTED_ERROR",
                        url,
                        "Error on getting resource: {} {}",
                        status,
                        body
                    );
                    error_retries -= 1;
                    tokio::time::sleep(retry.connection_error).await;
                } else {
                    tracing::error!(
                        message_id = "REQUEST_UNEXPECTED_ERROR",
                        url,
                        "Error on getting resource: {} {}",
                        status,
                        body
                    );
                    return None;
                }
            }
        }
    }
}
