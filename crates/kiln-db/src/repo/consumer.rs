//! Credentials: consumers and group tokens.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_core::auth::{Consumer, Identity};
use kiln_core::{ConsumerId, GroupId};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::{DbError, DbResult};

/// Database row for consumers.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ConsumerRow {
    pub id: Uuid,
    pub identity: Json<Identity>,
    pub issuer: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<ConsumerRow> for Consumer {
    fn from(row: ConsumerRow) -> Self {
        Consumer {
            id: ConsumerId::from_uuid(row.id),
            identity: row.identity.0,
            issuer: row.issuer,
            expires_at: row.expires_at,
            created_at: row.created_at,
        }
    }
}

pub(crate) async fn insert_consumer(
    conn: &mut PgConnection,
    consumer: &Consumer,
    token_hash: &str,
) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO consumers (id, token_hash, identity, issuer, expires_at, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(consumer.id.as_uuid())
    .bind(token_hash)
    .bind(Json(&consumer.identity))
    .bind(&consumer.issuer)
    .bind(consumer.expires_at)
    .bind(consumer.created_at)
    .execute(conn)
    .await
    .map_err(|e| DbError::on_insert(e, "consumer token"))?;

    Ok(())
}

/// Repository for credentials. Tokens are only ever looked up by hash.
#[async_trait]
pub trait ConsumerRepo: Send + Sync {
    async fn insert(&self, consumer: &Consumer, token_hash: &str) -> DbResult<()>;

    async fn find_by_token(&self, token_hash: &str) -> DbResult<Option<Consumer>>;

    async fn insert_group_token(&self, token_hash: &str, group_id: GroupId) -> DbResult<()>;

    /// Group a pre-issued registration token belongs to.
    async fn group_for_token(&self, token_hash: &str) -> DbResult<Option<GroupId>>;
}

/// PostgreSQL implementation.
pub struct PgConsumerRepo {
    pool: PgPool,
}

impl PgConsumerRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConsumerRepo for PgConsumerRepo {
    async fn insert(&self, consumer: &Consumer, token_hash: &str) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        insert_consumer(&mut *conn, consumer, token_hash).await
    }

    async fn find_by_token(&self, token_hash: &str) -> DbResult<Option<Consumer>> {
        let row = sqlx::query_as::<_, ConsumerRow>(
            "SELECT id, identity, issuer, expires_at, created_at FROM consumers WHERE token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Consumer::from))
    }

    async fn insert_group_token(&self, token_hash: &str, group_id: GroupId) -> DbResult<()> {
        sqlx::query("INSERT INTO group_tokens (token_hash, group_id) VALUES ($1, $2)")
            .bind(token_hash)
            .bind(group_id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| DbError::on_insert(e, "group token"))?;

        Ok(())
    }

    async fn group_for_token(&self, token_hash: &str) -> DbResult<Option<GroupId>> {
        let group: Option<Uuid> =
            sqlx::query_scalar("SELECT group_id FROM group_tokens WHERE token_hash = $1")
                .bind(token_hash)
                .fetch_optional(&self.pool)
                .await?;

        Ok(group.map(GroupId::from_uuid))
    }
}
