use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{JobStatus, JobType};

/// Postgres-backed store for pages, jobs, extractions and API keys.
///
/// Connections are lazy; schema administration (migrations, table creation)
/// lives outside this service.
#[derive(Debug, Clone)]
pub struct Store {
    pool: PgPool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiKeyRow {
    pub id: Uuid,
    pub key_hash: String,
    pub name: String,
    pub scopes: Vec<String>,
    pub rate_limit: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiKeyRow {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PageRow {
    pub id: Uuid,
    pub url: String,
    pub canonical_url: Option<String>,
    pub url_hash: String,
    pub content_hash: Option<String>,
    pub status_code: Option<i32>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub markdown: Option<String>,
    pub raw_html: Option<String>,
    pub renderer: Option<String>,
    pub links_internal: Option<Vec<String>>,
    pub links_external: Option<Vec<String>>,
    pub word_count: Option<i32>,
    pub read_time_minutes: Option<i32>,
    pub fetch_duration_ms: Option<i64>,
    pub og_image: Option<String>,
    pub favicon_url: Option<String>,
    pub site_name: Option<String>,
    pub language: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

/// Values for one page upsert. `fetched_at` is stamped at write time; the
/// upsert never lets an older fetch overwrite a newer row.
#[derive(Debug, Clone, Default)]
pub struct NewPage {
    pub url: String,
    pub canonical_url: Option<String>,
    pub url_hash: String,
    pub content_hash: Option<String>,
    pub status_code: Option<i32>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub markdown: Option<String>,
    pub raw_html: Option<String>,
    pub renderer: Option<String>,
    pub links_internal: Option<Vec<String>>,
    pub links_external: Option<Vec<String>>,
    pub word_count: Option<i32>,
    pub read_time_minutes: Option<i32>,
    pub fetch_duration_ms: Option<i64>,
    pub og_image: Option<String>,
    pub favicon_url: Option<String>,
    pub site_name: Option<String>,
    pub language: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl NewPage {
    /// Row recording a failed fetch; markdown stays empty.
    pub fn error(url: &str, url_hash: &str, code: &str, message: &str) -> Self {
        NewPage {
            url: url.to_string(),
            canonical_url: Some(url.to_string()),
            url_hash: url_hash.to_string(),
            error_code: Some(code.to_string()),
            error_message: Some(message.to_string()),
            ..NewPage::default()
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub api_key_id: Uuid,
    #[sqlx(rename = "type")]
    pub job_type: String,
    pub status: String,
    pub input_params: Value,
    pub idempotency_key: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub pages_discovered: i32,
    pub pages_total: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRow {
    pub fn status(&self) -> JobStatus {
        JobStatus::parse(&self.status).unwrap_or(JobStatus::Queued)
    }

    pub fn job_type(&self) -> Option<JobType> {
        JobType::parse(&self.job_type)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ExtractionRow {
    pub id: Uuid,
    pub job_id: Uuid,
    pub page_id: Option<Uuid>,
    pub data: Value,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
}

const PAGE_UPSERT: &str = r#"
INSERT INTO pages (
    id, url, canonical_url, url_hash, content_hash, status_code, title,
    description, markdown, raw_html, renderer, links_internal, links_external,
    word_count, read_time_minutes, fetch_duration_ms, og_image, favicon_url,
    site_name, language, fetched_at, error_code, error_message
) VALUES (
    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
    $17, $18, $19, $20, $21, $22, $23
)
ON CONFLICT (url_hash) DO UPDATE SET
    url = excluded.url,
    canonical_url = excluded.canonical_url,
    content_hash = excluded.content_hash,
    status_code = excluded.status_code,
    title = excluded.title,
    description = excluded.description,
    markdown = excluded.markdown,
    raw_html = excluded.raw_html,
    renderer = excluded.renderer,
    links_internal = excluded.links_internal,
    links_external = excluded.links_external,
    word_count = excluded.word_count,
    read_time_minutes = excluded.read_time_minutes,
    fetch_duration_ms = excluded.fetch_duration_ms,
    og_image = excluded.og_image,
    favicon_url = excluded.favicon_url,
    site_name = excluded.site_name,
    language = excluded.language,
    fetched_at = excluded.fetched_at,
    error_code = excluded.error_code,
    error_message = excluded.error_message
WHERE pages.fetched_at <= excluded.fetched_at
RETURNING *
"#;

impl Store {
    pub fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect_lazy(database_url)?;
        Ok(Store { pool })
    }

    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    // --- API keys ---

    pub async fn api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKeyRow>, sqlx::Error> {
        sqlx::query_as::<_, ApiKeyRow>("SELECT * FROM api_keys WHERE key_hash = $1")
            .bind(key_hash)
            .fetch_optional(&self.pool)
            .await
    }

    /// Best effort; a failed touch never fails the request.
    pub async fn touch_api_key(&self, id: Uuid) {
        let result = sqlx::query("UPDATE api_keys SET last_used_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await;
        if let Err(e) = result {
            tracing::debug!(error = %e, "Failed to update api key last_used_at");
        }
    }

    // --- Pages ---

    pub async fn page_by_url_hash(&self, url_hash: &str) -> Result<Option<PageRow>, sqlx::Error> {
        sqlx::query_as::<_, PageRow>("SELECT * FROM pages WHERE url_hash = $1")
            .bind(url_hash)
            .fetch_optional(&self.pool)
            .await
    }

    /// Upsert keyed by `url_hash`, conditioned on `fetched_at` so a straggler
    /// never replaces a newer fetch. Returns the current row either way.
    pub async fn upsert_page(&self, page: &NewPage) -> Result<PageRow, sqlx::Error> {
        let upserted = sqlx::query_as::<_, PageRow>(PAGE_UPSERT)
            .bind(Uuid::new_v4())
            .bind(&page.url)
            .bind(&page.canonical_url)
            .bind(&page.url_hash)
            .bind(&page.content_hash)
            .bind(page.status_code)
            .bind(&page.title)
            .bind(&page.description)
            .bind(&page.markdown)
            .bind(&page.raw_html)
            .bind(&page.renderer)
            .bind(&page.links_internal)
            .bind(&page.links_external)
            .bind(page.word_count)
            .bind(page.read_time_minutes)
            .bind(page.fetch_duration_ms)
            .bind(&page.og_image)
            .bind(&page.favicon_url)
            .bind(&page.site_name)
            .bind(&page.language)
            .bind(Utc::now())
            .bind(&page.error_code)
            .bind(&page.error_message)
            .fetch_optional(&self.pool)
            .await?;

        match upserted {
            Some(row) => Ok(row),
            // The conditional update skipped a stale write; the stored row wins.
            None => self
                .page_by_url_hash(&page.url_hash)
                .await?
                .ok_or(sqlx::Error::RowNotFound),
        }
    }

    /// Crawler upsert: refresh fetch facts, structure and metadata but leave
    /// any previously extracted content (markdown, content_hash, raw_html,
    /// word counts) untouched.
    pub async fn upsert_page_shallow(&self, page: &NewPage) -> Result<PageRow, sqlx::Error> {
        let upserted = sqlx::query_as::<_, PageRow>(
            r#"
            INSERT INTO pages (
                id, url, canonical_url, url_hash, status_code, title, description,
                renderer, links_internal, links_external, fetch_duration_ms,
                og_image, favicon_url, site_name, language, fetched_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (url_hash) DO UPDATE SET
                url = excluded.url,
                canonical_url = excluded.canonical_url,
                status_code = excluded.status_code,
                title = excluded.title,
                description = excluded.description,
                renderer = excluded.renderer,
                links_internal = excluded.links_internal,
                links_external = excluded.links_external,
                fetch_duration_ms = excluded.fetch_duration_ms,
                og_image = excluded.og_image,
                favicon_url = excluded.favicon_url,
                site_name = excluded.site_name,
                language = excluded.language,
                fetched_at = excluded.fetched_at,
                error_code = NULL,
                error_message = NULL
            WHERE pages.fetched_at <= excluded.fetched_at
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&page.url)
        .bind(&page.canonical_url)
        .bind(&page.url_hash)
        .bind(page.status_code)
        .bind(&page.title)
        .bind(&page.description)
        .bind(&page.renderer)
        .bind(&page.links_internal)
        .bind(&page.links_external)
        .bind(page.fetch_duration_ms)
        .bind(&page.og_image)
        .bind(&page.favicon_url)
        .bind(&page.site_name)
        .bind(&page.language)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        match upserted {
            Some(row) => Ok(row),
            None => self
                .page_by_url_hash(&page.url_hash)
                .await?
                .ok_or(sqlx::Error::RowNotFound),
        }
    }

    // --- Jobs ---

    pub async fn insert_job(
        &self,
        api_key_id: Uuid,
        job_type: JobType,
        input_params: &Value,
        idempotency_key: &str,
    ) -> Result<JobRow, sqlx::Error> {
        sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO jobs (id, api_key_id, type, status, input_params, idempotency_key, pages_discovered, created_at)
            VALUES ($1, $2, $3, 'queued', $4, $5, 0, now())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(api_key_id)
        .bind(job_type.as_str())
        .bind(input_params)
        .bind(idempotency_key)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn job_by_id(&self, id: Uuid) -> Result<Option<JobRow>, sqlx::Error> {
        sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn job_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<JobRow>, sqlx::Error> {
        sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE idempotency_key = $1")
            .bind(idempotency_key)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn mark_job_running(&self, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE jobs SET status = 'running', started_at = now() WHERE id = $1 AND status = 'queued'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_job_completed(&self, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE jobs SET status = 'completed', completed_at = now() WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_job_failed(
        &self,
        id: Uuid,
        error_code: &str,
        error_message: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', error_code = $2, error_message = $3, completed_at = now()
            WHERE id = $1 AND status IN ('queued', 'running')
            "#,
        )
        .bind(id)
        .bind(error_code)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_job_progress(
        &self,
        id: Uuid,
        pages_discovered: i32,
        pages_total: Option<i32>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE jobs SET pages_discovered = $2, pages_total = COALESCE($3, pages_total) WHERE id = $1",
        )
        .bind(id)
        .bind(pages_discovered)
        .bind(pages_total)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Promote stale `running` jobs to `failed`. Crash recovery: no job may
    /// stay running past the job timeout without a live worker.
    pub async fn fail_stale_running_jobs(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', error_code = 'JOB_TIMEOUT',
                error_message = 'Worker exceeded job timeout', completed_at = now()
            WHERE status = 'running' AND started_at < $1
            "#,
        )
        .bind(started_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_expired_jobs(
        &self,
        completed_before: DateTime<Utc>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN ('completed', 'failed')
              AND completed_at IS NOT NULL
              AND completed_at < $1
            "#,
        )
        .bind(completed_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // --- Job pages ---

    pub async fn insert_job_page(
        &self,
        job_id: Uuid,
        page_id: Uuid,
        depth: i32,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO job_pages (job_id, page_id, depth) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        )
        .bind(job_id)
        .bind(page_id)
        .bind(depth)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn job_page_urls(&self, job_id: Uuid) -> Result<Vec<String>, sqlx::Error> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT p.url
            FROM pages p
            JOIN job_pages jp ON p.id = jp.page_id
            WHERE jp.job_id = $1
            ORDER BY jp.depth, p.url
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(url,)| url).collect())
    }

    // --- Extractions ---

    pub async fn insert_extraction(
        &self,
        job_id: Uuid,
        page_id: Option<Uuid>,
        data: &Value,
        prompt: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO extractions (id, job_id, page_id, data, prompt, created_at)
            VALUES ($1, $2, $3, $4, $5, now())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job_id)
        .bind(page_id)
        .bind(data)
        .bind(prompt)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn extraction_by_job(
        &self,
        job_id: Uuid,
    ) -> Result<Option<ExtractionRow>, sqlx::Error> {
        sqlx::query_as::<_, ExtractionRow>(
            "SELECT * FROM extractions WHERE job_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_scope_check() {
        let key = ApiKeyRow {
            id: Uuid::new_v4(),
            key_hash: "h".to_string(),
            name: "test".to_string(),
            scopes: vec!["scrape".to_string(), "map".to_string()],
            rate_limit: 60,
            is_active: true,
            created_at: Utc::now(),
            last_used_at: None,
        };
        assert!(key.has_scope("scrape"));
        assert!(key.has_scope("map"));
        assert!(!key.has_scope("agent"));
    }

    #[test]
    fn test_job_row_enum_accessors() {
        let job = JobRow {
            id: Uuid::new_v4(),
            api_key_id: Uuid::new_v4(),
            job_type: "map".to_string(),
            status: "queued".to_string(),
            input_params: serde_json::json!({}),
            idempotency_key: None,
            error_code: None,
            error_message: None,
            pages_discovered: 0,
            pages_total: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        assert_eq!(job.status(), JobStatus::Queued);
        assert_eq!(job.job_type(), Some(JobType::Map));
    }

    #[test]
    fn test_new_page_error_row() {
        let page = NewPage::error(
            "https://example.com/x",
            "hash",
            "FETCH_ERROR",
            "connection refused",
        );
        assert_eq!(page.error_code.as_deref(), Some("FETCH_ERROR"));
        assert!(page.markdown.is_none());
        assert_eq!(page.url_hash, "hash");
    }
}
