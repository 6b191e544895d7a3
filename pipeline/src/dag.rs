//! Explicit dependency-edge resolver consulted by the queue on every claim.
//!
//! Edges are rows in `elt.job_dependencies`; acyclicity is validated with a
//! reachability probe at insert time so a cycle can never starve the claim
//! loop.

use pipeline_core::{Error, Result};
use sqlx::{PgConnection, PgPool};
use tracing::instrument;
use uuid::Uuid;

/// Transaction-scoped advisory lock serializing all edge inserts. Two
/// concurrent probes could otherwise each miss the other's uncommitted edge
/// and commit a cycle between them.
const EDGE_INSERT_LOCK: i64 = 0x6a6f_625f_6461_67; // "job_dag"

/// Add a dependency edge: `job_id` may not run until `depends_on_job_id`
/// succeeds. Rejects self-edges, duplicates, and edges that would close a
/// cycle; all three are coordination errors.
///
/// Must run inside a transaction: the probe and the insert are guarded by an
/// advisory lock that releases at commit, and a rejected edge rolls back with
/// everything else the caller staged.
#[instrument(skip(conn))]
pub async fn add_edge(
    conn: &mut PgConnection,
    job_id: Uuid,
    depends_on_job_id: Uuid,
) -> Result<()> {
    if job_id == depends_on_job_id {
        return Err(Error::Coordination(format!(
            "job {} cannot depend on itself",
            job_id
        )));
    }

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(EDGE_INSERT_LOCK)
        .execute(&mut *conn)
        .await?;

    // Walk the dependency closure upward from the proposed prerequisite; if
    // the dependent is reachable, the new edge would close a cycle.
    let would_cycle: bool = sqlx::query_scalar(
        r#"
        WITH RECURSIVE reach AS (
            SELECT depends_on_job_id AS node
            FROM elt.job_dependencies
            WHERE job_id = $2
            UNION
            SELECT d.depends_on_job_id
            FROM elt.job_dependencies d
            JOIN reach r ON d.job_id = r.node
        )
        SELECT EXISTS (SELECT 1 FROM reach WHERE node = $1)
        "#,
    )
    .bind(job_id)
    .bind(depends_on_job_id)
    .fetch_one(&mut *conn)
    .await?;

    if would_cycle {
        return Err(Error::Coordination(format!(
            "edge {} -> {} would create a dependency cycle",
            job_id, depends_on_job_id
        )));
    }

    let inserted = sqlx::query(
        r#"
        INSERT INTO elt.job_dependencies (job_id, depends_on_job_id)
        VALUES ($1, $2)
        ON CONFLICT (job_id, depends_on_job_id) DO NOTHING
        "#,
    )
    .bind(job_id)
    .bind(depends_on_job_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if inserted == 0 {
        return Err(Error::Coordination(format!(
            "duplicate dependency edge {} -> {}",
            job_id, depends_on_job_id
        )));
    }

    Ok(())
}

/// True iff every prerequisite of `job_id` is in the terminal success state.
/// Indexed by job_id; this sits on the claim hot path.
pub async fn is_ready(db: &PgPool, job_id: Uuid) -> Result<bool> {
    let blocked: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1
            FROM elt.job_dependencies d
            JOIN elt.jobs dep ON dep.id = d.depends_on_job_id
            WHERE d.job_id = $1
              AND dep.status <> 'succeeded'
        )
        "#,
    )
    .bind(job_id)
    .fetch_one(db)
    .await?;

    Ok(!blocked)
}

/// Direct dependents of a job (used for cancellation cascades and tooling).
pub async fn dependents_of(db: &PgPool, job_id: Uuid) -> Result<Vec<Uuid>> {
    let ids: Vec<Uuid> = sqlx::query_scalar(
        "SELECT job_id FROM elt.job_dependencies WHERE depends_on_job_id = $1",
    )
    .bind(job_id)
    .fetch_all(db)
    .await?;

    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    async fn test_pool() -> PgPool {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        PgPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .expect("connect to test database")
    }

    async fn insert_job(conn: &mut PgConnection) -> Uuid {
        sqlx::query_scalar(
            "INSERT INTO elt.jobs (job_type, status) VALUES ('archive', 'pending') RETURNING id",
        )
        .fetch_one(conn)
        .await
        .expect("insert job")
    }

    // Everything happens inside one rolled-back transaction, so the test
    // database is left untouched.
    #[tokio::test]
    #[ignore = "needs DATABASE_URL pointing at a migrated database"]
    async fn edge_closing_a_cycle_is_rejected() {
        let pool = test_pool().await;
        let mut tx = pool.begin().await.expect("begin");

        let a = insert_job(&mut tx).await;
        let b = insert_job(&mut tx).await;
        let c = insert_job(&mut tx).await;

        add_edge(&mut tx, b, a).await.expect("b depends on a");
        add_edge(&mut tx, c, b).await.expect("c depends on b");

        let err = add_edge(&mut tx, a, c).await.expect_err("cycle must fail");
        assert!(err.is_coordination());

        tx.rollback().await.expect("rollback");
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL pointing at a migrated database"]
    async fn duplicate_edge_is_rejected() {
        let pool = test_pool().await;
        let mut tx = pool.begin().await.expect("begin");

        let a = insert_job(&mut tx).await;
        let b = insert_job(&mut tx).await;

        add_edge(&mut tx, b, a).await.expect("first edge");
        let err = add_edge(&mut tx, b, a).await.expect_err("duplicate must fail");
        assert!(err.is_coordination());

        tx.rollback().await.expect("rollback");
    }
}
