//! Job repository: raw row access for the `batch_jobs` and
//! `batch_job_items` tables.
//!
//! Every write touching a job and its items runs in a single transaction.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Database, DatabaseError};

const JOB_COLUMNS: &str = "id, external_job_id, status, item_count, diagnostic, poll_failures,
     next_poll_at, revision, created_at, updated_at, submitted_at, finished_at";

const ITEM_COLUMNS: &str = "id, job_id, position, source_reference, prompt, status,
     artifact_reference, error_detail, delivered_at, surfaced_at, updated_at";

/// A raw job row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: String,
    pub external_job_id: Option<String>,
    pub status: String,
    pub item_count: i64,
    pub diagnostic: Option<String>,
    pub poll_failures: i64,
    pub next_poll_at: Option<String>,
    pub revision: i64,
    pub created_at: String,
    pub updated_at: String,
    pub submitted_at: Option<String>,
    pub finished_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            external_job_id: row.get("external_job_id")?,
            status: row.get("status")?,
            item_count: row.get("item_count")?,
            diagnostic: row.get("diagnostic")?,
            poll_failures: row.get("poll_failures")?,
            next_poll_at: row.get("next_poll_at")?,
            revision: row.get("revision")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            submitted_at: row.get("submitted_at")?,
            finished_at: row.get("finished_at")?,
        })
    }
}

/// A raw item row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemRow {
    pub id: String,
    pub job_id: String,
    pub position: i64,
    pub source_reference: String,
    pub prompt: String,
    pub status: String,
    pub artifact_reference: Option<String>,
    pub error_detail: Option<String>,
    pub delivered_at: Option<String>,
    pub surfaced_at: Option<String>,
    pub updated_at: String,
}

impl ItemRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            position: row.get("position")?,
            source_reference: row.get("source_reference")?,
            prompt: row.get("prompt")?,
            status: row.get("status")?,
            artifact_reference: row.get("artifact_reference")?,
            error_detail: row.get("error_detail")?,
            delivered_at: row.get("delivered_at")?,
            surfaced_at: row.get("surfaced_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// A terminal item result to write, keyed by item id.
#[derive(Debug, Clone)]
pub struct ItemResultRow {
    pub id: String,
    pub status: String,
    pub artifact_reference: Option<String>,
    pub error_detail: Option<String>,
}

/// The optimistic-lock token a guarded write must still observe.
#[derive(Debug, Clone)]
pub struct Expected<'a> {
    pub status: &'a str,
    pub revision: i64,
}

/// Query filter parameters for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub status: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Inserts a job and all of its items in one transaction.
pub fn insert_job_with_items(
    db: &Database,
    job: &JobRow,
    items: &[ItemRow],
) -> Result<(), DatabaseError> {
    db.with_transaction(|tx| {
        tx.execute(
            "INSERT INTO batch_jobs (id, external_job_id, status, item_count, diagnostic,
             poll_failures, next_poll_at, revision, created_at, updated_at, submitted_at,
             finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                job.id,
                job.external_job_id,
                job.status,
                job.item_count,
                job.diagnostic,
                job.poll_failures,
                job.next_poll_at,
                job.revision,
                job.created_at,
                job.updated_at,
                job.submitted_at,
                job.finished_at,
            ],
        )?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO batch_job_items (id, job_id, position, source_reference, prompt,
                 status, artifact_reference, error_detail, delivered_at, surfaced_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for item in items {
                stmt.execute(params![
                    item.id,
                    item.job_id,
                    item.position,
                    item.source_reference,
                    item.prompt,
                    item.status,
                    item.artifact_reference,
                    item.error_detail,
                    item.delivered_at,
                    item.surfaced_at,
                    item.updated_at,
                ])?;
            }
        }
        Ok(())
    })
}

/// Writes a job's mutable fields and applies item results, guarded by the
/// job's `(status, revision)`.
///
/// Returns `false` (and writes nothing) when the job no longer matches
/// `expected`. Item results only touch items that are still pending, so
/// re-applying the same results is a no-op.
pub fn update_job_guarded(
    db: &Database,
    job: &JobRow,
    expected: &Expected<'_>,
    item_results: &[ItemResultRow],
) -> Result<bool, DatabaseError> {
    db.with_transaction(|tx| {
        let changed = tx.execute(
            "UPDATE batch_jobs SET external_job_id=?4, status=?5, diagnostic=?6,
             poll_failures=?7, next_poll_at=?8, updated_at=?9, submitted_at=?10,
             finished_at=?11, revision=revision + 1
             WHERE id=?1 AND status=?2 AND revision=?3",
            params![
                job.id,
                expected.status,
                expected.revision,
                job.external_job_id,
                job.status,
                job.diagnostic,
                job.poll_failures,
                job.next_poll_at,
                job.updated_at,
                job.submitted_at,
                job.finished_at,
            ],
        )?;

        if changed == 0 {
            return Ok(false);
        }

        {
            let mut stmt = tx.prepare(
                "UPDATE batch_job_items SET status=?3, artifact_reference=?4, error_detail=?5,
                 updated_at=?6
                 WHERE id=?1 AND job_id=?2 AND status='pending'",
            )?;
            for result in item_results {
                stmt.execute(params![
                    result.id,
                    job.id,
                    result.status,
                    result.artifact_reference,
                    result.error_detail,
                    job.updated_at,
                ])?;
            }
        }
        Ok(true)
    })
}

/// Finds a job by its ID.
pub fn find_job(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| find_job_in(conn, id))
}

fn find_job_in(conn: &Connection, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    let sql = format!("SELECT {} FROM batch_jobs WHERE id = ?1", JOB_COLUMNS);
    Ok(conn
        .query_row(&sql, params![id], JobRow::from_row)
        .optional()?)
}

/// Finds a job and its items, read under one lock acquisition so the pair
/// is consistent.
pub fn find_job_with_items(
    db: &Database,
    id: &str,
) -> Result<Option<(JobRow, Vec<ItemRow>)>, DatabaseError> {
    db.with_conn(|conn| {
        let Some(job) = find_job_in(conn, id)? else {
            return Ok(None);
        };
        let items = find_items_in(conn, id)?;
        Ok(Some((job, items)))
    })
}

/// Returns a job's items ordered by position.
pub fn find_items(db: &Database, job_id: &str) -> Result<Vec<ItemRow>, DatabaseError> {
    db.with_conn(|conn| find_items_in(conn, job_id))
}

fn find_items_in(conn: &Connection, job_id: &str) -> Result<Vec<ItemRow>, DatabaseError> {
    let sql = format!(
        "SELECT {} FROM batch_job_items WHERE job_id = ?1 ORDER BY position ASC",
        ITEM_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![job_id], ItemRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Returns all jobs whose status is one of `statuses`, oldest first.
pub fn find_jobs_by_status(
    db: &Database,
    statuses: &[&str],
) -> Result<Vec<JobRow>, DatabaseError> {
    if statuses.is_empty() {
        return Ok(Vec::new());
    }

    db.with_conn(|conn| {
        let placeholders: Vec<String> = (1..=statuses.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "SELECT {} FROM batch_jobs WHERE status IN ({}) ORDER BY created_at ASC",
            JOB_COLUMNS,
            placeholders.join(", ")
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(statuses.iter()), JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Queries jobs with filters, returning (rows, total_count).
pub fn query(db: &Database, filter: &JobFilter) -> Result<(Vec<JobRow>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref status) = filter.status {
            conditions.push(format!("status = ?{}", param_values.len() + 1));
            param_values.push(Box::new(status.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM batch_jobs {}", where_clause);
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

        let limit = filter.limit.unwrap_or(100) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;
        param_values.push(Box::new(limit));
        param_values.push(Box::new(offset));
        let query_sql = format!(
            "SELECT {} FROM batch_jobs {} ORDER BY created_at DESC LIMIT ?{} OFFSET ?{}",
            JOB_COLUMNS,
            where_clause,
            param_values.len() - 1,
            param_values.len()
        );

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&query_sql)?;
        let rows: Vec<JobRow> = stmt
            .query_map(params_ref.as_slice(), JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((rows, total))
    })
}

/// Completed items of deliverable jobs that have not been delivered yet,
/// oldest job first.
pub fn find_undelivered_items(
    db: &Database,
    job_statuses: &[&str],
) -> Result<Vec<ItemRow>, DatabaseError> {
    find_items_of_jobs(
        db,
        "i.status = 'completed' AND i.delivered_at IS NULL",
        job_statuses,
    )
}

/// Failed items of finished jobs that have not been reported yet.
pub fn find_unsurfaced_failed_items(
    db: &Database,
    job_statuses: &[&str],
) -> Result<Vec<ItemRow>, DatabaseError> {
    find_items_of_jobs(
        db,
        "i.status = 'failed' AND i.surfaced_at IS NULL",
        job_statuses,
    )
}

fn find_items_of_jobs(
    db: &Database,
    item_condition: &str,
    job_statuses: &[&str],
) -> Result<Vec<ItemRow>, DatabaseError> {
    if job_statuses.is_empty() {
        return Ok(Vec::new());
    }

    db.with_conn(|conn| {
        let placeholders: Vec<String> =
            (1..=job_statuses.len()).map(|i| format!("?{}", i)).collect();
        let columns: Vec<String> = ITEM_COLUMNS
            .split(',')
            .map(|c| format!("i.{}", c.trim()))
            .collect();
        let sql = format!(
            "SELECT {} FROM batch_job_items i
             JOIN batch_jobs j ON j.id = i.job_id
             WHERE {} AND j.status IN ({})
             ORDER BY j.created_at ASC, i.position ASC",
            columns.join(", "),
            item_condition,
            placeholders.join(", ")
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(job_statuses.iter()),
                ItemRow::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Sets the delivery flag on a completed item. Returns `false` if the item
/// was already delivered (or is not completed).
pub fn mark_delivered(
    db: &Database,
    item_id: &str,
    delivered_at: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE batch_job_items SET delivered_at = ?2, updated_at = ?2
             WHERE id = ?1 AND status = 'completed' AND delivered_at IS NULL",
            params![item_id, delivered_at],
        )?;
        Ok(changed > 0)
    })
}

/// Records that a failed item has been reported. Returns `false` if it
/// already was.
pub fn mark_surfaced(db: &Database, item_id: &str, surfaced_at: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE batch_job_items SET surfaced_at = ?2
             WHERE id = ?1 AND status = 'failed' AND surfaced_at IS NULL",
            params![item_id, surfaced_at],
        )?;
        Ok(changed > 0)
    })
}

/// Counts jobs grouped by status.
pub fn count_jobs_by_status(db: &Database) -> Result<Vec<(String, u64)>, DatabaseError> {
    count_grouped(db, "SELECT status, COUNT(*) FROM batch_jobs GROUP BY status")
}

/// Counts items grouped by status.
pub fn count_items_by_status(db: &Database) -> Result<Vec<(String, u64)>, DatabaseError> {
    count_grouped(
        db,
        "SELECT status, COUNT(*) FROM batch_job_items GROUP BY status",
    )
}

/// Counts failed items grouped by their error detail, most frequent first.
pub fn count_item_errors(db: &Database) -> Result<Vec<(String, u64)>, DatabaseError> {
    count_grouped(
        db,
        "SELECT error_detail, COUNT(*) AS n FROM batch_job_items
         WHERE status = 'failed' AND error_detail IS NOT NULL
         GROUP BY error_detail ORDER BY n DESC, error_detail ASC",
    )
}

/// Counts items that have been handed to the artifact sink.
pub fn count_delivered_items(db: &Database) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM batch_job_items WHERE delivered_at IS NOT NULL",
            [],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

fn count_grouped(db: &Database, sql: &str) -> Result<Vec<(String, u64)>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, u64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn sample_job(id: &str) -> JobRow {
        JobRow {
            id: id.to_string(),
            external_job_id: None,
            status: "pending".to_string(),
            item_count: 2,
            diagnostic: None,
            poll_failures: 0,
            next_poll_at: None,
            revision: 0,
            created_at: "2026-01-01T00:00:00+00:00".to_string(),
            updated_at: "2026-01-01T00:00:00+00:00".to_string(),
            submitted_at: None,
            finished_at: None,
        }
    }

    fn sample_items(job_id: &str) -> Vec<ItemRow> {
        (0..2)
            .map(|i| ItemRow {
                id: format!("{}-item-{}", job_id, i),
                job_id: job_id.to_string(),
                position: i,
                source_reference: format!("row-{}", i),
                prompt: format!("prompt {}", i),
                status: "pending".to_string(),
                artifact_reference: None,
                error_detail: None,
                delivered_at: None,
                surfaced_at: None,
                updated_at: "2026-01-01T00:00:00+00:00".to_string(),
            })
            .collect()
    }

    fn completed(id: &str, artifact: &str) -> ItemResultRow {
        ItemResultRow {
            id: id.to_string(),
            status: "completed".to_string(),
            artifact_reference: Some(artifact.to_string()),
            error_detail: None,
        }
    }

    #[test]
    fn test_insert_and_find() {
        let db = test_db();
        insert_job_with_items(&db, &sample_job("job-1"), &sample_items("job-1")).unwrap();

        let (job, items) = find_job_with_items(&db, "job-1").unwrap().unwrap();
        assert_eq!(job.status, "pending");
        assert_eq!(job.item_count, 2);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].position, 0);
        assert_eq!(items[1].source_reference, "row-1");
    }

    #[test]
    fn test_find_nonexistent() {
        let db = test_db();
        assert!(find_job(&db, "nope").unwrap().is_none());
        assert!(find_job_with_items(&db, "nope").unwrap().is_none());
    }

    #[test]
    fn test_insert_is_atomic() {
        let db = test_db();
        let mut items = sample_items("job-1");
        // Duplicate primary key makes the second item insert fail.
        items[1].id = items[0].id.clone();

        let result = insert_job_with_items(&db, &sample_job("job-1"), &items);
        assert!(result.is_err());
        assert!(find_job(&db, "job-1").unwrap().is_none());
        assert!(find_items(&db, "job-1").unwrap().is_empty());
    }

    #[test]
    fn test_guarded_update_commits_and_bumps_revision() {
        let db = test_db();
        insert_job_with_items(&db, &sample_job("job-1"), &sample_items("job-1")).unwrap();

        let mut next = sample_job("job-1");
        next.status = "running".to_string();
        next.external_job_id = Some("ext-1".to_string());
        let ok = update_job_guarded(
            &db,
            &next,
            &Expected {
                status: "pending",
                revision: 0,
            },
            &[completed("job-1-item-0", "a.png")],
        )
        .unwrap();
        assert!(ok);

        let (job, items) = find_job_with_items(&db, "job-1").unwrap().unwrap();
        assert_eq!(job.status, "running");
        assert_eq!(job.revision, 1);
        assert_eq!(items[0].status, "completed");
        assert_eq!(items[0].artifact_reference.as_deref(), Some("a.png"));
        assert_eq!(items[1].status, "pending");
    }

    #[test]
    fn test_guarded_update_rejects_stale_token() {
        let db = test_db();
        insert_job_with_items(&db, &sample_job("job-1"), &sample_items("job-1")).unwrap();

        let mut next = sample_job("job-1");
        next.status = "cancelled".to_string();
        let ok = update_job_guarded(
            &db,
            &next,
            &Expected {
                status: "pending",
                revision: 7,
            },
            &[completed("job-1-item-0", "a.png")],
        )
        .unwrap();
        assert!(!ok);

        let (job, items) = find_job_with_items(&db, "job-1").unwrap().unwrap();
        assert_eq!(job.status, "pending");
        assert_eq!(items[0].status, "pending");
    }

    #[test]
    fn test_item_results_never_overwrite_terminal_items() {
        let db = test_db();
        insert_job_with_items(&db, &sample_job("job-1"), &sample_items("job-1")).unwrap();

        let job = sample_job("job-1");
        update_job_guarded(
            &db,
            &job,
            &Expected {
                status: "pending",
                revision: 0,
            },
            &[completed("job-1-item-0", "first.png")],
        )
        .unwrap();

        let failed = ItemResultRow {
            id: "job-1-item-0".to_string(),
            status: "failed".to_string(),
            artifact_reference: None,
            error_detail: Some("late error".to_string()),
        };
        update_job_guarded(
            &db,
            &job,
            &Expected {
                status: "pending",
                revision: 1,
            },
            &[failed],
        )
        .unwrap();

        let items = find_items(&db, "job-1").unwrap();
        assert_eq!(items[0].status, "completed");
        assert_eq!(items[0].artifact_reference.as_deref(), Some("first.png"));
        assert!(items[0].error_detail.is_none());
    }

    #[test]
    fn test_find_jobs_by_status() {
        let db = test_db();
        insert_job_with_items(&db, &sample_job("a"), &[]).unwrap();
        let mut running = sample_job("b");
        running.status = "running".to_string();
        insert_job_with_items(&db, &running, &[]).unwrap();
        let mut done = sample_job("c");
        done.status = "completed".to_string();
        insert_job_with_items(&db, &done, &[]).unwrap();

        let rows = find_jobs_by_status(&db, &["submitted", "running"]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "b");
        assert!(find_jobs_by_status(&db, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_query_pagination_and_filter() {
        let db = test_db();
        for i in 0..10 {
            let mut job = sample_job(&format!("p{}", i));
            job.created_at = format!("2026-01-{:02}T00:00:00+00:00", i + 1);
            if i % 2 == 0 {
                job.status = "failed".to_string();
            }
            insert_job_with_items(&db, &job, &[]).unwrap();
        }

        let (rows, total) = query(
            &db,
            &JobFilter {
                limit: Some(3),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(total, 10);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].id, "p9");

        let (rows, total) = query(
            &db,
            &JobFilter {
                status: Some("failed".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(total, 5);
        assert!(rows.iter().all(|r| r.status == "failed"));
    }

    #[test]
    fn test_undelivered_items_and_mark_delivered() {
        let db = test_db();
        insert_job_with_items(&db, &sample_job("job-1"), &sample_items("job-1")).unwrap();

        let mut done = sample_job("job-1");
        done.status = "completed".to_string();
        update_job_guarded(
            &db,
            &done,
            &Expected {
                status: "pending",
                revision: 0,
            },
            &[
                completed("job-1-item-0", "a.png"),
                completed("job-1-item-1", "b.png"),
            ],
        )
        .unwrap();

        let pending = find_undelivered_items(&db, &["completed"]).unwrap();
        assert_eq!(pending.len(), 2);

        assert!(mark_delivered(&db, "job-1-item-0", "2026-01-02T00:00:00+00:00").unwrap());
        assert!(!mark_delivered(&db, "job-1-item-0", "2026-01-03T00:00:00+00:00").unwrap());

        let pending = find_undelivered_items(&db, &["completed"]).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "job-1-item-1");
        assert_eq!(count_delivered_items(&db).unwrap(), 1);
    }

    #[test]
    fn test_grouped_counts() {
        let db = test_db();
        insert_job_with_items(&db, &sample_job("job-1"), &sample_items("job-1")).unwrap();
        let job = sample_job("job-1");
        let failed = |id: &str| ItemResultRow {
            id: id.to_string(),
            status: "failed".to_string(),
            artifact_reference: None,
            error_detail: Some("SAFETY".to_string()),
        };
        update_job_guarded(
            &db,
            &job,
            &Expected {
                status: "pending",
                revision: 0,
            },
            &[failed("job-1-item-0"), failed("job-1-item-1")],
        )
        .unwrap();

        assert_eq!(
            count_jobs_by_status(&db).unwrap(),
            vec![("pending".to_string(), 1)]
        );
        assert_eq!(
            count_items_by_status(&db).unwrap(),
            vec![("failed".to_string(), 2)]
        );
        assert_eq!(
            count_item_errors(&db).unwrap(),
            vec![("SAFETY".to_string(), 2)]
        );
    }

    #[test]
    fn test_unsurfaced_failed_items() {
        let db = test_db();
        insert_job_with_items(&db, &sample_job("job-1"), &sample_items("job-1")).unwrap();
        let mut partial = sample_job("job-1");
        partial.status = "partially_completed".to_string();
        let failed = ItemResultRow {
            id: "job-1-item-1".to_string(),
            status: "failed".to_string(),
            artifact_reference: None,
            error_detail: Some("blocked".to_string()),
        };
        update_job_guarded(
            &db,
            &partial,
            &Expected {
                status: "pending",
                revision: 0,
            },
            &[completed("job-1-item-0", "a.png"), failed],
        )
        .unwrap();

        let rows = find_unsurfaced_failed_items(&db, &["partially_completed"]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].error_detail.as_deref(), Some("blocked"));

        // Completed items cannot be marked surfaced.
        assert!(!mark_surfaced(&db, "job-1-item-0", "2026-01-02T00:00:00+00:00").unwrap());
        assert!(mark_surfaced(&db, "job-1-item-1", "2026-01-02T00:00:00+00:00").unwrap());
        assert!(find_unsurfaced_failed_items(&db, &["partially_completed"])
            .unwrap()
            .is_empty());
    }
}
