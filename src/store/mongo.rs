//! Document-store position backend (MongoDB).
//!
//! The position lives in one document with a fixed `_id`. Saves are
//! `$set` upserts of just the patched fields; drop `$unset`s the three
//! cursor/session fields so date-modified history survives a cursor
//! invalidation.

use std::time::Duration;

use anyhow::{Context, Result};
use mongodb::bson::{doc, from_document, Document};
use mongodb::{Client, Collection};

use super::{
    FeedPosition, BACKWARD_OFFSET_KEY, EARLIEST_DATE_MODIFIED_KEY, FORWARD_OFFSET_KEY,
    LATEST_DATE_MODIFIED_KEY, LOCK_DATE_MODIFIED_KEY, SERVER_ID_KEY,
};
use crate::config::MongoConfig;
use crate::position::PositionPatch;

pub struct MongoStore {
    collection: Collection<Document>,
    state_id: String,
    db_error_interval: Duration,
}

impl MongoStore {
    pub async fn connect(config: &MongoConfig, db_error_interval: Duration) -> Result<Self> {
        let client = Client::with_uri_str(&config.url)
            .await
            .context("connecting to document store")?;
        let collection = client
            .database(&config.database)
            .collection::<Document>(&config.state_collection);
        Ok(Self {
            collection,
            state_id: config.state_id.clone(),
            db_error_interval,
        })
    }

    pub async fn get(&self) -> Option<FeedPosition> {
        loop {
            match self
                .collection
                .find_one(doc! {"_id": self.state_id.as_str()})
                .await
            {
                Ok(found) => {
                    return found.and_then(|mut document| {
                        document.remove("_id");
                        match from_document::<FeedPosition>(document) {
                            Ok(position) => Some(position),
                            Err(e) => {
                                tracing::warn!(
                                    message_id = "MONGODB_EXC",
                                    "Undecodable feed position: {}",
                                    e
                                );
                                None
                            }
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(message_id = "MONGODB_EXC", "Get feed position: {}", e);
                    tokio::time::sleep(self.db_error_interval).await;
                }
            }
        }
    }

    pub async fn save(&self, patch: &PositionPatch) {
        let set = patch_to_document(patch);
        if set.is_empty() {
            return;
        }
        loop {
            match self
                .collection
                .update_one(doc! {"_id": self.state_id.as_str()}, doc! {"$set": set.clone()})
                .upsert(true)
                .await
            {
                Ok(_) => return,
                Err(e) => {
                    tracing::warn!(message_id = "MONGODB_EXC", "Save feed position: {}", e);
                    tokio::time::sleep(self.db_error_interval).await;
                }
            }
        }
    }

    pub async fn drop_position(&self) {
        loop {
            match self
                .collection
                .update_one(
                    doc! {"_id": self.state_id.as_str()},
                    doc! {"$unset": drop_unset_document()},
                )
                .await
            {
                Ok(_) => return,
                Err(e) => {
                    tracing::warn!(message_id = "MONGODB_EXC", "Drop feed position: {}", e);
                    tokio::time::sleep(self.db_error_interval).await;
                }
            }
        }
    }

    pub async fn set_lock_date_modified(&self, value: bool) {
        loop {
            match self
                .collection
                .update_one(
                    doc! {"_id": self.state_id.as_str()},
                    doc! {"$set": {LOCK_DATE_MODIFIED_KEY: value}},
                )
                .await
            {
                Ok(_) => return,
                Err(e) => {
                    tracing::warn!(
                        message_id = "MONGODB_EXC",
                        "Set date-modified latch: {}",
                        e
                    );
                    tokio::time::sleep(self.db_error_interval).await;
                }
            }
        }
    }

    pub async fn close(&self) {
        // The driver's connection pool tears down on drop.
    }
}

/// `$set` document for a patch: only the present fields.
fn patch_to_document(patch: &PositionPatch) -> Document {
    let mut set = Document::new();
    if let Some(v) = &patch.forward_offset {
        set.insert(FORWARD_OFFSET_KEY, v.as_str());
    }
    if let Some(v) = &patch.backward_offset {
        set.insert(BACKWARD_OFFSET_KEY, v.as_str());
    }
    if let Some(v) = &patch.latest_date_modified {
        set.insert(LATEST_DATE_MODIFIED_KEY, v.as_str());
    }
    if let Some(v) = &patch.earliest_date_modified {
        set.insert(EARLIEST_DATE_MODIFIED_KEY, v.as_str());
    }
    if let Some(v) = &patch.server_id {
        set.insert(SERVER_ID_KEY, v.as_str());
    }
    set
}

/// `$unset` document for drop: cursors and session stickiness only.
fn drop_unset_document() -> Document {
    doc! {
        FORWARD_OFFSET_KEY: "",
        BACKWARD_OFFSET_KEY: "",
        SERVER_ID_KEY: "",
    }
}
