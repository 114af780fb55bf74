//! Worker model repository. Models are managed elsewhere; this subsystem
//! only reads them.

use async_trait::async_trait;
use kiln_core::model::WorkerModel;
use kiln_core::{GroupId, ModelId};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{DbError, DbResult};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkerModelRow {
    pub id: Uuid,
    pub name: String,
    pub group_id: Uuid,
}

impl From<WorkerModelRow> for WorkerModel {
    fn from(row: WorkerModelRow) -> Self {
        WorkerModel {
            id: ModelId::from_uuid(row.id),
            name: row.name,
            group_id: GroupId::from_uuid(row.group_id),
        }
    }
}

#[async_trait]
pub trait ModelRepo: Send + Sync {
    async fn insert(&self, model: &WorkerModel) -> DbResult<()>;

    async fn get(&self, id: ModelId) -> DbResult<WorkerModel>;
}

/// PostgreSQL implementation.
pub struct PgModelRepo {
    pool: PgPool,
}

impl PgModelRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ModelRepo for PgModelRepo {
    async fn insert(&self, model: &WorkerModel) -> DbResult<()> {
        sqlx::query("INSERT INTO worker_models (id, name, group_id) VALUES ($1, $2, $3)")
            .bind(model.id.as_uuid())
            .bind(&model.name)
            .bind(model.group_id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| DbError::on_insert(e, format!("worker model '{}'", model.name)))?;

        Ok(())
    }

    async fn get(&self, id: ModelId) -> DbResult<WorkerModel> {
        let row = sqlx::query_as::<_, WorkerModelRow>("SELECT * FROM worker_models WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("worker model {}", id)))?;

        Ok(row.into())
    }
}
