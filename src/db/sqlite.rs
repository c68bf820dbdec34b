use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::cat::decision::AgentSnapshot;
use crate::cat::persistence::{AbilityStore, AgentStateStore, ItemBank, ResponseSource, StoreError};
use crate::cat::types::{AbilityEstimate, CategoryId, Item, ItemParams, Response};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS "items" (
      "id" INTEGER PRIMARY KEY,
      "category_id" INTEGER NOT NULL,
      "a" REAL NOT NULL,
      "b" REAL NOT NULL,
      "c" REAL NOT NULL,
      "elo_difficulty" REAL NOT NULL
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS "idx_items_category" ON "items" ("category_id")"#,
    r#"
    CREATE TABLE IF NOT EXISTS "responses" (
      "seq" INTEGER PRIMARY KEY AUTOINCREMENT,
      "learner_id" TEXT NOT NULL,
      "item_id" INTEGER NOT NULL,
      "category_id" INTEGER NOT NULL,
      "a" REAL NOT NULL,
      "b" REAL NOT NULL,
      "c" REAL NOT NULL,
      "elo_difficulty" REAL NOT NULL,
      "correct" INTEGER NOT NULL,
      "time_spent" REAL NOT NULL,
      "answered_at" INTEGER NOT NULL
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS "idx_responses_learner" ON "responses" ("learner_id", "category_id")"#,
    r#"
    CREATE TABLE IF NOT EXISTS "ability_estimates" (
      "learner_id" TEXT NOT NULL,
      "category_id" INTEGER NOT NULL,
      "irt_theta" REAL NOT NULL,
      "elo_rating" REAL NOT NULL,
      "elo_time_rating" REAL,
      "updated_at" INTEGER NOT NULL,
      PRIMARY KEY ("learner_id", "category_id")
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS "agent_state" (
      "id" INTEGER PRIMARY KEY CHECK ("id" = 1),
      "version" INTEGER NOT NULL,
      "payload" TEXT NOT NULL,
      "updated_at" INTEGER NOT NULL
    )
    "#,
];

/// SQLite-backed store. The agent checkpoint lives in a single row.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        tracing::info!(url = %database_url, "SQLite pool initialized");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create missing tables. Safe to run on every start.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        tracing::debug!(statements = SCHEMA.len(), "SQLite schema applied");
        Ok(())
    }

    pub async fn insert_items(&self, items: &[Item]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for item in items {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO "items" ("id", "category_id", "a", "b", "c", "elo_difficulty")
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(item.id)
            .bind(item.category_id)
            .bind(item.params.a)
            .bind(item.params.b)
            .bind(item.params.c)
            .bind(item.elo_difficulty)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Append a response. Insertion order is the order the engine replays.
    pub async fn record_response(&self, learner_id: &str, response: &Response) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO "responses" (
              "learner_id", "item_id", "category_id", "a", "b", "c",
              "elo_difficulty", "correct", "time_spent", "answered_at"
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(learner_id)
        .bind(response.item_id)
        .bind(response.category_id)
        .bind(response.params.a)
        .bind(response.params.b)
        .bind(response.params.c)
        .bind(response.elo_difficulty)
        .bind(if response.correct { 1 } else { 0 })
        .bind(response.time_spent)
        .bind(response.answered_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ResponseSource for SqliteStore {
    async fn get_responses(
        &self,
        learner_id: &str,
        category_id: Option<CategoryId>,
    ) -> Result<Vec<Response>, StoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT "item_id", "category_id", "a", "b", "c", "elo_difficulty",
                   "correct", "time_spent", "answered_at"
            FROM "responses" WHERE "learner_id" = "#,
        );
        qb.push_bind(learner_id);
        if let Some(category_id) = category_id {
            qb.push(r#" AND "category_id" = "#);
            qb.push_bind(category_id);
        }
        qb.push(r#" ORDER BY "seq" ASC"#);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(map_response_row).collect()
    }
}

#[async_trait]
impl ItemBank for SqliteStore {
    async fn get_item_pool(&self, category_ids: &[CategoryId]) -> Result<Vec<Item>, StoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            r#"SELECT "id", "category_id", "a", "b", "c", "elo_difficulty" FROM "items""#,
        );
        if !category_ids.is_empty() {
            qb.push(r#" WHERE "category_id" IN ("#);
            let mut separated = qb.separated(", ");
            for id in category_ids {
                separated.push_bind(*id);
            }
            qb.push(")");
        }
        qb.push(r#" ORDER BY "category_id" ASC, "id" ASC"#);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(map_item_row).collect()
    }
}

#[async_trait]
impl AbilityStore for SqliteStore {
    async fn load_ability(
        &self,
        learner_id: &str,
        category_id: CategoryId,
    ) -> Result<Option<AbilityEstimate>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT "learner_id", "category_id", "irt_theta", "elo_rating", "elo_time_rating", "updated_at"
            FROM "ability_estimates"
            WHERE "learner_id" = ? AND "category_id" = ?
            "#,
        )
        .bind(learner_id)
        .bind(category_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(map_ability_row).transpose()
    }

    async fn save_ability(&self, estimate: &AbilityEstimate) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO "ability_estimates" (
              "learner_id", "category_id", "irt_theta", "elo_rating", "elo_time_rating", "updated_at"
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT ("learner_id", "category_id") DO UPDATE SET
              "irt_theta" = excluded."irt_theta",
              "elo_rating" = excluded."elo_rating",
              "elo_time_rating" = excluded."elo_time_rating",
              "updated_at" = excluded."updated_at"
            "#,
        )
        .bind(&estimate.learner_id)
        .bind(estimate.category_id)
        .bind(estimate.irt_theta)
        .bind(estimate.elo_rating)
        .bind(estimate.elo_time_rating)
        .bind(estimate.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_abilities(&self, learner_id: &str) -> Result<Vec<AbilityEstimate>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT "learner_id", "category_id", "irt_theta", "elo_rating", "elo_time_rating", "updated_at"
            FROM "ability_estimates"
            WHERE "learner_id" = ?
            ORDER BY "category_id" ASC
            "#,
        )
        .bind(learner_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_ability_row).collect()
    }
}

#[async_trait]
impl AgentStateStore for SqliteStore {
    async fn load_agent_state(&self) -> Result<Option<AgentSnapshot>, StoreError> {
        let payload: Option<String> =
            sqlx::query_scalar(r#"SELECT "payload" FROM "agent_state" WHERE "id" = 1"#)
                .fetch_optional(&self.pool)
                .await?;

        match payload {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save_agent_state(&self, snapshot: &AgentSnapshot) -> Result<(), StoreError> {
        let payload = serde_json::to_string(snapshot)?;
        sqlx::query(
            r#"
            INSERT INTO "agent_state" ("id", "version", "payload", "updated_at")
            VALUES (1, ?, ?, ?)
            ON CONFLICT ("id") DO UPDATE SET
              "version" = excluded."version",
              "payload" = excluded."payload",
              "updated_at" = excluded."updated_at"
            "#,
        )
        .bind(snapshot.version as i64)
        .bind(payload)
        .bind(snapshot.saved_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn map_item_row(row: &SqliteRow) -> Result<Item, StoreError> {
    Ok(Item {
        id: row.try_get("id")?,
        category_id: row.try_get("category_id")?,
        params: ItemParams::new(row.try_get("a")?, row.try_get("b")?, row.try_get("c")?),
        elo_difficulty: row.try_get("elo_difficulty")?,
    })
}

fn map_response_row(row: &SqliteRow) -> Result<Response, StoreError> {
    let correct: i64 = row.try_get("correct")?;
    Ok(Response {
        item_id: row.try_get("item_id")?,
        category_id: row.try_get("category_id")?,
        params: ItemParams::new(row.try_get("a")?, row.try_get("b")?, row.try_get("c")?),
        elo_difficulty: row.try_get("elo_difficulty")?,
        correct: correct != 0,
        time_spent: row.try_get("time_spent")?,
        answered_at: row.try_get("answered_at")?,
    })
}

fn map_ability_row(row: &SqliteRow) -> Result<AbilityEstimate, StoreError> {
    Ok(AbilityEstimate {
        learner_id: row.try_get("learner_id")?,
        category_id: row.try_get("category_id")?,
        irt_theta: row.try_get("irt_theta")?,
        elo_rating: row.try_get("elo_rating")?,
        elo_time_rating: row.try_get("elo_time_rating")?,
        updated_at: row.try_get("updated_at")?,
    })
}
