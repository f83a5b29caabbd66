//! Page and snippet queries

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::db::core::{Page, PageStatus, Snippet};
use crate::docset::extract_doc_set_from_url;
use crate::error::Result;

/// Insert or update the page row for a discovered file. The docset is
/// precomputed from the URL so leaderboards never parse URLs at query time.
pub async fn upsert_discovered_page(
    pool: &PgPool,
    scan_id: i64,
    url: &str,
    github_sha: &str,
    content_hash: &str,
) -> Result<Page> {
    let doc_set = extract_doc_set_from_url(url);

    let existing = find_page(pool, scan_id, url).await?;
    let page = match existing {
        Some(page) => {
            sqlx::query_as::<_, Page>(
                r#"
                UPDATE pages
                SET github_sha = $1, content_hash = $2, last_scanned_at = $3,
                    status = 'discovered', processing_state = 'discovered', doc_set = $4
                WHERE id = $5
                RETURNING *
                "#,
            )
            .bind(github_sha)
            .bind(content_hash)
            .bind(Utc::now())
            .bind(&doc_set)
            .bind(page.id)
            .fetch_one(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, Page>(
                r#"
                INSERT INTO pages (scan_id, url, status, processing_state, github_sha,
                                   content_hash, last_scanned_at, doc_set)
                VALUES ($1, $2, 'discovered', 'discovered', $3, $4, $5, $6)
                RETURNING *
                "#,
            )
            .bind(scan_id)
            .bind(url)
            .bind(github_sha)
            .bind(content_hash)
            .bind(Utc::now())
            .bind(&doc_set)
            .fetch_one(pool)
            .await?
        }
    };
    Ok(page)
}

pub async fn get_page(pool: &PgPool, page_id: i64) -> Result<Option<Page>> {
    let page = sqlx::query_as::<_, Page>("SELECT * FROM pages WHERE id = $1")
        .bind(page_id)
        .fetch_optional(pool)
        .await?;
    Ok(page)
}

pub async fn find_page(pool: &PgPool, scan_id: i64, url: &str) -> Result<Option<Page>> {
    let page = sqlx::query_as::<_, Page>("SELECT * FROM pages WHERE scan_id = $1 AND url = $2")
        .bind(scan_id)
        .bind(url)
        .fetch_optional(pool)
        .await?;
    Ok(page)
}

/// Set status and the mirrored processing_state together.
pub async fn set_status(pool: &PgPool, page_id: i64, status: PageStatus) -> Result<()> {
    sqlx::query("UPDATE pages SET status = $1, processing_state = $1 WHERE id = $2")
        .bind(status.as_str())
        .bind(page_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Transition into `processing`, stamping the worker lock mirror.
pub async fn begin_processing(
    pool: &PgPool,
    page_id: i64,
    worker_id: &str,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE pages
        SET status = 'processing', processing_state = 'processing',
            processing_started_at = $1, processing_worker_id = $2, processing_expires_at = $3
        WHERE id = $4
        "#,
    )
    .bind(Utc::now())
    .bind(worker_id)
    .bind(expires_at)
    .bind(page_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Leave `processing`. All three processing_* fields are cleared on every
/// exit path so the invariant "non-processing pages carry no lock mirror"
/// holds.
pub async fn finish_processing(pool: &PgPool, page_id: i64, success: bool) -> Result<()> {
    if success {
        sqlx::query(
            r#"
            UPDATE pages
            SET status = 'processed', processing_state = 'processed',
                processing_started_at = NULL, processing_worker_id = NULL,
                processing_expires_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(page_id)
        .execute(pool)
        .await?;
    } else {
        sqlx::query(
            r#"
            UPDATE pages
            SET status = 'error', processing_state = 'error', last_error_at = $1,
                processing_started_at = NULL, processing_worker_id = NULL,
                processing_expires_at = NULL
            WHERE id = $2
            "#,
        )
        .bind(Utc::now())
        .bind(page_id)
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// Re-queue an errored page for another attempt.
pub async fn reset_for_retry(pool: &PgPool, page_id: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE pages
        SET status = 'queued', processing_state = 'queued', retry_count = retry_count + 1
        WHERE id = $1
        "#,
    )
    .bind(page_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_holistic(
    pool: &PgPool,
    page_id: i64,
    holistic: &serde_json::Value,
) -> Result<()> {
    sqlx::query("UPDATE pages SET mcp_holistic = $1 WHERE id = $2")
        .bind(holistic)
        .bind(page_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Pages whose holistic review is still parked on the LLM queue. The
/// finalization predicate refuses to close the scan while any remain.
pub async fn pending_llm_count(pool: &PgPool, scan_id: i64) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM pages
        WHERE scan_id = $1 AND mcp_holistic ->> 'review_method' = 'llm_pending'
        "#,
    )
    .bind(scan_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

pub async fn count_with_status(pool: &PgPool, scan_id: i64, status: PageStatus) -> Result<i64> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM pages WHERE scan_id = $1 AND status = $2")
            .bind(scan_id)
            .bind(status.as_str())
            .fetch_one(pool)
            .await?;
    Ok(count)
}

/// Holistic payloads for every page of a scan; used to compute the
/// biased-page aggregate with the severity rule applied in one place.
pub async fn holistic_results(pool: &PgPool, scan_id: i64) -> Result<Vec<serde_json::Value>> {
    let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
        "SELECT mcp_holistic FROM pages WHERE scan_id = $1 AND mcp_holistic IS NOT NULL",
    )
    .bind(scan_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(v,)| v).collect())
}

// ============================================================================
// Snippets
// ============================================================================

pub async fn insert_snippet(
    pool: &PgPool,
    page_id: i64,
    context: &str,
    code: &str,
) -> Result<Snippet> {
    let snippet = sqlx::query_as::<_, Snippet>(
        "INSERT INTO snippets (page_id, context, code) VALUES ($1, $2, $3) RETURNING *",
    )
    .bind(page_id)
    .bind(context)
    .bind(code)
    .fetch_one(pool)
    .await?;
    Ok(snippet)
}

pub async fn set_snippet_score(
    pool: &PgPool,
    snippet_id: i64,
    score: &serde_json::Value,
) -> Result<()> {
    sqlx::query("UPDATE snippets SET llm_score = $1 WHERE id = $2")
        .bind(score)
        .bind(snippet_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Snippets that carry a score, across the whole scan.
pub async fn count_flagged_snippets(pool: &PgPool, scan_id: i64) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM snippets s
        JOIN pages p ON s.page_id = p.id
        WHERE p.scan_id = $1 AND s.llm_score IS NOT NULL
        "#,
    )
    .bind(scan_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}
