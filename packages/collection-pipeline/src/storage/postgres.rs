//! Postgres-backed relational and document stores.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::error::{StoreError, StoreResult};
use crate::traits::{DocumentStore, RelationalStore};
use crate::types::{
    DedupOutcome, Fingerprint, JobId, QualityAssessment, QualityBand, RecordId, StoreKind,
    StoredRecord, UpsertOutcome,
};

/// Create the pipeline tables if they do not exist.
pub async fn run_migrations(pool: &PgPool) -> StoreResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stored_records (
            id UUID PRIMARY KEY,
            source TEXT NOT NULL,
            data_type TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            band TEXT NOT NULL,
            payload JSONB NOT NULL,
            first_seen_at TIMESTAMPTZ NOT NULL,
            last_seen_at TIMESTAMPTZ NOT NULL,
            stores_written TEXT[] NOT NULL DEFAULT '{}',
            UNIQUE (source, data_type, fingerprint)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS quality_assessments (
            id BIGSERIAL PRIMARY KEY,
            source TEXT NOT NULL,
            data_type TEXT NOT NULL,
            job_id UUID NOT NULL,
            total BIGINT NOT NULL,
            valid BIGINT NOT NULL,
            errors BIGINT NOT NULL,
            band TEXT NOT NULL,
            assessed_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS quality_assessments_source_type_time
            ON quality_assessments (source, data_type, assessed_at)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            key TEXT PRIMARY KEY,
            document JSONB NOT NULL,
            expires_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

fn band_from_str(raw: &str) -> QualityBand {
    match raw {
        "high" => QualityBand::High,
        "medium" => QualityBand::Medium,
        "low" => QualityBand::Low,
        _ => QualityBand::Invalid,
    }
}

fn store_kind_from_str(raw: &str) -> Option<StoreKind> {
    match raw {
        "relational" => Some(StoreKind::Relational),
        "document" => Some(StoreKind::Document),
        "cache" => Some(StoreKind::Cache),
        "vector_index" => Some(StoreKind::VectorIndex),
        _ => None,
    }
}

fn record_from_row(r: sqlx::postgres::PgRow) -> StoredRecord {
    StoredRecord {
        id: RecordId(r.get("id")),
        source: r.get("source"),
        data_type: r.get("data_type"),
        fingerprint: Fingerprint(r.get("fingerprint")),
        band: band_from_str(r.get("band")),
        payload: r.get("payload"),
        first_seen_at: r.get("first_seen_at"),
        last_seen_at: r.get("last_seen_at"),
        stores_written: r
            .get::<Vec<String>, _>("stores_written")
            .iter()
            .filter_map(|s| store_kind_from_str(s))
            .collect(),
    }
}

pub struct PostgresRelationalStore {
    pool: PgPool,
}

impl PostgresRelationalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RelationalStore for PostgresRelationalStore {
    async fn upsert_record(&self, record: &StoredRecord) -> StoreResult<UpsertOutcome> {
        let stores: Vec<String> = record
            .stores_written
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        // xmax = 0 distinguishes a fresh INSERT from a conflict UPDATE.
        let row = sqlx::query(
            r#"
            INSERT INTO stored_records (
                id, source, data_type, fingerprint, band, payload,
                first_seen_at, last_seen_at, stores_written
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (source, data_type, fingerprint) DO UPDATE SET
                band = EXCLUDED.band,
                payload = EXCLUDED.payload,
                last_seen_at = EXCLUDED.last_seen_at,
                stores_written = (
                    SELECT ARRAY(
                        SELECT DISTINCT unnest(stored_records.stores_written || EXCLUDED.stores_written)
                    )
                )
            RETURNING id, (xmax = 0) as was_inserted
            "#,
        )
        .bind(record.id.0)
        .bind(&record.source)
        .bind(&record.data_type)
        .bind(&record.fingerprint.0)
        .bind(record.band.as_str())
        .bind(&record.payload)
        .bind(record.first_seen_at)
        .bind(record.last_seen_at)
        .bind(&stores)
        .fetch_one(&self.pool)
        .await?;

        Ok(UpsertOutcome {
            record_id: RecordId(row.get("id")),
            was_inserted: row.get("was_inserted"),
        })
    }

    async fn check_fingerprint(
        &self,
        source: &str,
        data_type: &str,
        fingerprint: &Fingerprint,
        window: chrono::Duration,
    ) -> StoreResult<DedupOutcome> {
        let cutoff = Utc::now() - window;

        let row = sqlx::query(
            r#"
            SELECT (last_seen_at >= $4) as fresh
            FROM stored_records
            WHERE source = $1 AND data_type = $2 AND fingerprint = $3
            "#,
        )
        .bind(source)
        .bind(data_type)
        .bind(&fingerprint.0)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            None => DedupOutcome::New,
            Some(row) if row.get::<bool, _>("fresh") => DedupOutcome::Duplicate,
            Some(_) => DedupOutcome::Refresh,
        })
    }

    async fn find_by_fingerprint(
        &self,
        source: &str,
        data_type: &str,
        fingerprint: &Fingerprint,
    ) -> StoreResult<Option<StoredRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, source, data_type, fingerprint, band, payload,
                   first_seen_at, last_seen_at, stores_written
            FROM stored_records
            WHERE source = $1 AND data_type = $2 AND fingerprint = $3
            "#,
        )
        .bind(source)
        .bind(data_type)
        .bind(&fingerprint.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(record_from_row))
    }

    async fn records_in_range(
        &self,
        source: &str,
        data_type: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<StoredRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, source, data_type, fingerprint, band, payload,
                   first_seen_at, last_seen_at, stores_written
            FROM stored_records
            WHERE source = $1 AND data_type = $2
              AND last_seen_at >= $3 AND last_seen_at <= $4
            ORDER BY last_seen_at DESC
            "#,
        )
        .bind(source)
        .bind(data_type)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(record_from_row).collect())
    }

    async fn save_assessment(
        &self,
        source: &str,
        data_type: &str,
        job_id: JobId,
        assessment: &QualityAssessment,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO quality_assessments (
                source, data_type, job_id, total, valid, errors, band, assessed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(source)
        .bind(data_type)
        .bind(job_id.0)
        .bind(assessment.total as i64)
        .bind(assessment.valid as i64)
        .bind(assessment.errors as i64)
        .bind(assessment.band.as_str())
        .bind(assessment.assessed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn assessments_in_range(
        &self,
        source: &str,
        data_type: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<QualityAssessment>> {
        let rows = sqlx::query(
            r#"
            SELECT total, valid, errors, band, assessed_at
            FROM quality_assessments
            WHERE source = $1 AND data_type = $2
              AND assessed_at >= $3 AND assessed_at <= $4
            ORDER BY assessed_at ASC
            "#,
        )
        .bind(source)
        .bind(data_type)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| QualityAssessment {
                total: r.get::<i64, _>("total") as u64,
                valid: r.get::<i64, _>("valid") as u64,
                errors: r.get::<i64, _>("errors") as u64,
                band: band_from_str(r.get("band")),
                assessed_at: r.get("assessed_at"),
            })
            .collect())
    }
}

pub struct PostgresDocumentStore {
    pool: PgPool,
}

impl PostgresDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentStore for PostgresDocumentStore {
    async fn put(
        &self,
        key: &str,
        document: &serde_json::Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (key, document, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE SET
                document = EXCLUDED.document,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(document)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Document(Box::new(e)))?;

        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<serde_json::Value>> {
        let row = sqlx::query(
            r#"
            SELECT document
            FROM documents
            WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Document(Box::new(e)))?;

        Ok(row.map(|r| r.get("document")))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM documents WHERE expires_at IS NOT NULL AND expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Document(Box::new(e)))?;

        Ok(result.rows_affected())
    }
}
