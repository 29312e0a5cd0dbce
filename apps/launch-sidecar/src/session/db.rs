use super::store::{SampleRecord, SessionRecord, SessionStore};
use crate::error::StoreError;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json as SqlJson;
use sqlx::{PgPool, Row};

/// Postgres-backed session documents, one row per session id.
#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS launch_sessions (
                session_id BIGINT PRIMARY KEY,
                start_date TEXT,
                end_date TEXT,
                variables JSONB NOT NULL DEFAULT '[]'::jsonb,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.pool.is_closed() {
            return Err(StoreError::Unavailable("connection pool closed".to_string()));
        }
        Ok(())
    }
}

impl SessionStore for PgSessionStore {
    async fn upsert(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.check_open()?;
        sqlx::query(
            r#"
            INSERT INTO launch_sessions (session_id, start_date, end_date, variables, updated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (session_id) DO UPDATE SET
                start_date = EXCLUDED.start_date,
                end_date = EXCLUDED.end_date,
                variables = EXCLUDED.variables,
                updated_at = now()
            "#,
        )
        .bind(record.session_id)
        .bind(record.start_date.as_deref())
        .bind(record.end_date.as_deref())
        .bind(SqlJson(&record.variables))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, session_id: i64) -> Result<Option<SessionRecord>, StoreError> {
        self.check_open()?;
        let row = sqlx::query(
            r#"
            SELECT session_id, start_date, end_date, variables
            FROM launch_sessions
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let SqlJson(variables) = row.try_get::<SqlJson<Vec<SampleRecord>>, _>("variables")?;
        Ok(Some(SessionRecord {
            session_id: row.try_get::<i64, _>("session_id")?,
            start_date: row.try_get::<Option<String>, _>("start_date")?,
            end_date: row.try_get::<Option<String>, _>("end_date")?,
            variables,
        }))
    }
}
