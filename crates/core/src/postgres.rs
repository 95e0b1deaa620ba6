//! Postgres-backed question store and score ledger.
//!
//! One connection pool is shared by every session. Each query checks a
//! connection out for its own duration only, so no session holds storage
//! while it waits on transcription or evaluation.

use crate::ledger::ScoreLedger;
use crate::question_store::QuestionStore;
use crate::types::{EvaluationRecord, Identity, Question};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

const CREATE_QUESTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS questions (
    id          BIGSERIAL PRIMARY KEY,
    username    TEXT NOT NULL,
    ordinal     INTEGER NOT NULL CHECK (ordinal >= 0),
    text        TEXT NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (username, ordinal)
)"#;

const CREATE_SCORES: &str = r#"
CREATE TABLE IF NOT EXISTS scores (
    record_id       UUID PRIMARY KEY,
    username        TEXT NOT NULL,
    question_id     BIGINT REFERENCES questions (id) ON DELETE SET NULL,
    question_index  INTEGER NOT NULL,
    transcript      TEXT NOT NULL,
    evaluation      TEXT NOT NULL,
    score           SMALLINT NOT NULL CHECK (score BETWEEN 0 AND 10),
    created_at      TIMESTAMPTZ NOT NULL
)"#;

const CREATE_SCORES_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS scores_username_idx ON scores (username, created_at)";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to Postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the `questions` and `scores` tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in [CREATE_QUESTIONS, CREATE_SCORES, CREATE_SCORES_INDEX] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to create database schema")?;
        }
        info!("Database schema is ready");
        Ok(())
    }
}

fn question_from_row(row: &PgRow) -> Result<Question> {
    Ok(Question {
        id: row.try_get("id")?,
        ordinal: u32::try_from(row.try_get::<i32, _>("ordinal")?)?,
        text: row.try_get("text")?,
    })
}

#[async_trait]
impl QuestionStore for PgStore {
    async fn fetch_question(&self, identity: &Identity, ordinal: u32) -> Result<Option<Question>> {
        // Ordinals beyond the INTEGER range cannot be stored.
        let Ok(ordinal) = i32::try_from(ordinal) else {
            return Ok(None);
        };
        let row = sqlx::query("SELECT id, ordinal, text FROM questions WHERE username = $1 AND ordinal = $2")
            .bind(identity.as_str())
            .bind(ordinal)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch question")?;

        row.as_ref().map(question_from_row).transpose()
    }

    async fn replace_questions(
        &self,
        identity: &Identity,
        texts: &[String],
    ) -> Result<Vec<Question>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM questions WHERE username = $1")
            .bind(identity.as_str())
            .execute(&mut *tx)
            .await
            .context("Failed to clear previous questions")?;

        let mut questions = Vec::with_capacity(texts.len());
        for (ordinal, text) in texts.iter().enumerate() {
            let row = sqlx::query(
                "INSERT INTO questions (username, ordinal, text) VALUES ($1, $2, $3) RETURNING id, ordinal, text",
            )
            .bind(identity.as_str())
            .bind(i32::try_from(ordinal)?)
            .bind(text)
            .fetch_one(&mut *tx)
            .await
            .context("Failed to insert question")?;
            questions.push(question_from_row(&row)?);
        }

        tx.commit().await?;
        Ok(questions)
    }
}

#[async_trait]
impl ScoreLedger for PgStore {
    async fn persist(&self, record: &EvaluationRecord) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO scores
                (record_id, username, question_id, question_index, transcript, evaluation, score, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               ON CONFLICT (record_id) DO NOTHING"#,
        )
        .bind(record.record_id)
        .bind(record.identity.as_str())
        .bind(record.question_id)
        .bind(i32::try_from(record.ordinal)?)
        .bind(&record.transcript)
        .bind(&record.feedback)
        .bind(i16::from(record.score.value()))
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert score record")?;
        Ok(())
    }
}
