//! Relational position backend (PostgreSQL).
//!
//! Keeps one persistent connection and serializes every statement
//! through it, reconnecting when the server drops the link. The schema
//! is just the row of cursors; the date-modified latch has no column
//! here, so `lock`/`unlock` are reported unsupported by the caller.

use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio_postgres::{Client, NoTls};

use super::{FeedPosition, BACKWARD_OFFSET_KEY, FORWARD_OFFSET_KEY};
use crate::config::PostgresConfig;
use crate::position::PositionPatch;

pub struct PgStore {
    config: PostgresConfig,
    db_error_interval: Duration,
    connection: Mutex<Option<Client>>,
}

impl PgStore {
    /// Connect and make sure the state table exists. Retries forever,
    /// like every other operation on this backend.
    pub async fn connect(config: PostgresConfig, db_error_interval: Duration) -> Self {
        let store = Self {
            config,
            db_error_interval,
            connection: Mutex::new(None),
        };
        store.ensure_schema().await;
        store
    }

    async fn ensure_schema(&self) {
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id varchar PRIMARY KEY,
                {} varchar,
                {} varchar
            )",
            self.config.state_table, FORWARD_OFFSET_KEY, BACKWARD_OFFSET_KEY
        );
        loop {
            let mut guard = self.connected().await;
            let Some(client) = guard.as_ref() else {
                continue;
            };
            match client.execute(create.as_str(), &[]).await {
                Ok(_) => return,
                Err(e) => self.handle_error(&mut guard, &e).await,
            }
        }
    }

    pub async fn get(&self) -> Option<FeedPosition> {
        let select = format!(
            "SELECT {}, {} FROM {} WHERE id = $1",
            FORWARD_OFFSET_KEY, BACKWARD_OFFSET_KEY, self.config.state_table
        );
        loop {
            let mut guard = self.connected().await;
            let Some(client) = guard.as_ref() else {
                continue;
            };
            match client.query_opt(select.as_str(), &[&self.config.state_id]).await {
                Ok(row) => {
                    return row.map(|row| FeedPosition {
                        forward_offset: non_empty(row.get(0)),
                        backward_offset: non_empty(row.get(1)),
                        ..Default::default()
                    });
                }
                Err(e) => self.handle_error(&mut guard, &e).await,
            }
        }
    }

    /// UPDATE the direction's offset column, INSERT the row when the
    /// UPDATE touched nothing.
    pub async fn save(&self, patch: &PositionPatch) {
        let Some((column, value)) = offset_assignment(patch) else {
            return;
        };
        let update = format!(
            "UPDATE {} SET {} = $1 WHERE id = $2",
            self.config.state_table, column
        );
        let insert = format!(
            "INSERT INTO {} (id, {}, {}) VALUES ($1, $2, $3)",
            self.config.state_table, FORWARD_OFFSET_KEY, BACKWARD_OFFSET_KEY
        );
        loop {
            let mut guard = self.connected().await;
            let Some(client) = guard.as_ref() else {
                continue;
            };
            match client.execute(update.as_str(), &[&value, &self.config.state_id]).await {
                Ok(0) => {
                    let forward = patch.forward_offset.as_deref().unwrap_or("");
                    let backward = patch.backward_offset.as_deref().unwrap_or("");
                    match client
                        .execute(insert.as_str(), &[&self.config.state_id, &forward, &backward])
                        .await
                    {
                        Ok(1) => return,
                        Ok(n) => {
                            tracing::error!("Unexpected insert result: {} rows", n);
                            return;
                        }
                        Err(e) => self.handle_error(&mut guard, &e).await,
                    }
                }
                Ok(_) => return,
                Err(e) => self.handle_error(&mut guard, &e).await,
            }
        }
    }

    pub async fn drop_position(&self) {
        let delete = format!("DELETE FROM {} WHERE id = $1", self.config.state_table);
        loop {
            let mut guard = self.connected().await;
            let Some(client) = guard.as_ref() else {
                continue;
            };
            match client.execute(delete.as_str(), &[&self.config.state_id]).await {
                Ok(_) => return,
                Err(e) => self.handle_error(&mut guard, &e).await,
            }
        }
    }

    pub async fn close(&self) {
        self.connection.lock().await.take();
    }

    /// Lock the connection slot, (re)connecting first when needed.
    async fn connected(&self) -> MutexGuard<'_, Option<Client>> {
        let mut guard = self.connection.lock().await;
        while guard.as_ref().map_or(true, Client::is_closed) {
            match self.open_connection().await {
                Ok(client) => *guard = Some(client),
                Err(e) => {
                    tracing::error!("Unable to connect to postgres: {}", e);
                    tokio::time::sleep(self.db_error_interval).await;
                }
            }
        }
        guard
    }

    async fn open_connection(&self) -> Result<Client, tokio_postgres::Error> {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&self.config.host)
            .port(self.config.port)
            .user(&self.config.user)
            .password(&self.config.password)
            .dbname(&self.config.db);
        let (client, connection) = pg.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!("postgres connection closed: {}", e);
            }
        });
        Ok(client)
    }

    async fn handle_error(&self, guard: &mut MutexGuard<'_, Option<Client>>, e: &tokio_postgres::Error) {
        tracing::warn!("sql command error: {}", e);
        if guard.as_ref().map_or(true, Client::is_closed) {
            guard.take();
        }
        tokio::time::sleep(self.db_error_interval).await;
    }
}

/// Which offset column a patch writes. Forward wins when both are set.
fn offset_assignment(patch: &PositionPatch) -> Option<(&'static str, &str)> {
    if let Some(v) = &patch.forward_offset {
        return Some((FORWARD_OFFSET_KEY, v));
    }
    if let Some(v) = &patch.backward_offset {
        return Some((BACKWARD_OFFSET_KEY, v));
    }
    None
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_offset_assignment_picks_direction_column() {
        let forward = PositionPatch {
            forward_offset: Some("f".to_string()),
            ..Default::default()
        };
        assert_eq!(offset_assignment(&forward), Some(("forward_offset", "f")));

        let backward = PositionPatch {
            backward_offset: Some("b".to_string()),
            ..Default::default()
        };
        assert_eq!(offset_assignment(&backward), Some(("backward_offset", "b")));

        assert_eq!(offset_assignment(&PositionPatch::default()), None);
    }

    #[test]
    fn test_empty_columns_read_as_missing() {
        assert_eq!(non_empty(Some(String::new())), None);
        assert_eq!(non_empty(Some("f".to_string())), Some("f".to_string()));
        assert_eq!(non_empty(None), None);
    }
}
