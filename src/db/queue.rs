use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, SqliteConnection};
use tokio_stream::StreamExt;

#[derive(Serialize, Deserialize, FromRow, Debug)]
pub struct Queue {
    pub id: i64,
    pub name: String,
    pub created_at: i64,
}

impl PartialEq for Queue {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Job counts for one queue, as shown on the admin surface.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStatistics {
    pub name: String,
    /// Due for delivery now
    pub waiting: i64,
    /// Waiting, but backing off until a later `available_at`
    pub delayed: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
}

const STATISTICS: &str = "
    SELECT
        q.name AS name,
        COALESCE(SUM(CASE WHEN j.state = 'waiting' AND j.available_at <= $1 THEN 1 ELSE 0 END), 0) AS waiting,
        COALESCE(SUM(CASE WHEN j.state = 'waiting' AND j.available_at > $1 THEN 1 ELSE 0 END), 0) AS delayed,
        COALESCE(SUM(CASE WHEN j.state = 'active' THEN 1 ELSE 0 END), 0) AS active,
        COALESCE(SUM(CASE WHEN j.state = 'completed' THEN 1 ELSE 0 END), 0) AS completed,
        COALESCE(SUM(CASE WHEN j.state = 'failed' THEN 1 ELSE 0 END), 0) AS failed
    FROM queues q
    LEFT JOIN jobs j ON j.queue = q.id
";

impl Queue {
    /// Inserts the queue if it does not exist yet and returns its id.
    pub async fn ensure(db: &mut SqliteConnection, name: impl AsRef<str>, now: i64) -> eyre::Result<i64> {
        sqlx::query("INSERT OR IGNORE INTO queues (name, created_at) VALUES ($1, $2)")
            .bind(name.as_ref())
            .bind(now)
            .execute(&mut *db)
            .await?;

        Ok(Self::get_id(db, name)
            .await?
            .ok_or_else(|| eyre::eyre!("queue vanished after insert"))?)
    }

    pub async fn get_id(db: &mut SqliteConnection, name: impl AsRef<str>) -> eyre::Result<Option<i64>> {
        sqlx::query_scalar("SELECT id FROM queues WHERE name = $1")
            .bind(name.as_ref())
            .fetch_optional(db)
            .await
            .map_err(|e| eyre::eyre!(e))
    }

    pub async fn list(db: &mut SqliteConnection) -> eyre::Result<Vec<Queue>> {
        let mut stream = sqlx::query_as("SELECT id, name, created_at FROM queues ORDER BY name").fetch(db);

        let mut queues = Vec::new();

        while let Some(res) = stream.next().await.transpose()? {
            queues.push(res);
        }

        Ok(queues)
    }

    pub async fn statistics(db: &mut SqliteConnection, now: i64) -> eyre::Result<Vec<QueueStatistics>> {
        Ok(
            sqlx::query_as(&format!("{STATISTICS} GROUP BY q.id, q.name ORDER BY q.name"))
                .bind(now)
                .fetch_all(db)
                .await?,
        )
    }

    pub async fn statistics_for(
        db: &mut SqliteConnection,
        name: impl AsRef<str>,
        now: i64,
    ) -> eyre::Result<Option<QueueStatistics>> {
        Ok(
            sqlx::query_as(&format!("{STATISTICS} WHERE q.name = $2 GROUP BY q.id, q.name"))
                .bind(now)
                .bind(name.as_ref())
                .fetch_optional(db)
                .await?,
        )
    }
}
