//! Project, application and environment variables.

use async_trait::async_trait;
use kiln_core::GroupId;
use kiln_core::job::Job;
use kiln_core::secret::{SecretResolver, Variable, VariableScope};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{DbError, DbResult};

/// A variable as stored. `scope_name` is the project key, application name
/// or environment name the variable belongs to.
#[derive(Debug, Clone)]
pub struct NewVariable {
    pub group_id: GroupId,
    pub scope: VariableScope,
    pub scope_name: String,
    pub name: String,
    pub value: String,
    pub secret: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct SecretRow {
    scope: String,
    name: String,
    value: String,
}

impl TryFrom<SecretRow> for Variable {
    type Error = DbError;

    fn try_from(row: SecretRow) -> Result<Self, Self::Error> {
        let scope: VariableScope = row.scope.parse()?;
        Ok(Variable {
            name: Variable::qualified_name(scope, &row.name),
            value: row.value,
            scope,
        })
    }
}

#[async_trait]
pub trait VariableRepo: SecretResolver {
    async fn insert(&self, variable: NewVariable) -> DbResult<()>;
}

/// PostgreSQL implementation.
pub struct PgVariableRepo {
    pool: PgPool,
}

impl PgVariableRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VariableRepo for PgVariableRepo {
    async fn insert(&self, variable: NewVariable) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO variables (id, group_id, scope, scope_name, name, value, secret)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(variable.group_id.as_uuid())
        .bind(variable.scope.as_str())
        .bind(&variable.scope_name)
        .bind(&variable.name)
        .bind(&variable.value)
        .bind(variable.secret)
        .execute(&self.pool)
        .await
        .map_err(|e| DbError::on_insert(e, format!("variable '{}'", variable.name)))?;

        Ok(())
    }
}

#[async_trait]
impl SecretResolver for PgVariableRepo {
    async fn resolve(&self, job: &Job) -> kiln_core::Result<Vec<Variable>> {
        let rows = sqlx::query_as::<_, SecretRow>(
            r#"
            SELECT scope, name, value FROM variables
            WHERE group_id = $1 AND secret
              AND (
                (scope = 'project' AND scope_name = $2)
                OR (scope = 'application' AND scope_name = $3)
                OR (scope = 'environment' AND scope_name = $4)
              )
            ORDER BY scope, name
            "#,
        )
        .bind(job.group_id.as_uuid())
        .bind(&job.project_key)
        .bind(&job.application)
        .bind(&job.environment)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        let vars = rows
            .into_iter()
            .map(Variable::try_from)
            .collect::<DbResult<Vec<_>>>()?;
        Ok(vars)
    }
}
