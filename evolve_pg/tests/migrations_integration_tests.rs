mod common;

use evolve_pg::migrations::Migrator;
use serial_test::serial;
use sqlx::PgPool;

async fn teardown(pool: &PgPool) {
    sqlx::query("DROP TABLE IF EXISTS evolve_batched_jobs CASCADE")
        .execute(pool)
        .await
        .expect("Failed to drop jobs table");
    sqlx::query("DROP TABLE IF EXISTS evolve_batched_migrations CASCADE")
        .execute(pool)
        .await
        .expect("Failed to drop migrations table");
    sqlx::query("DROP TABLE IF EXISTS _evolve_migrations CASCADE")
        .execute(pool)
        .await
        .expect("Failed to drop tracking table");
}

#[tokio::test]
#[serial]
async fn migrator_creates_tracking_table() {
    let pool = common::get_pg_pool().await;
    teardown(&pool).await;

    let migrator = Migrator::new(pool.clone());

    let version = migrator.current_version().await.expect("Should get version");
    assert_eq!(version, 0, "Initial version should be 0");

    let result: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*)
        FROM information_schema.tables
        WHERE table_name = '_evolve_migrations'
        "#,
    )
    .fetch_one(&pool)
    .await
    .expect("Failed to query information_schema");
    assert_eq!(result.0, 1, "_evolve_migrations table should exist");

    teardown(&pool).await;
}

#[tokio::test]
#[serial]
async fn migrator_creates_batched_migration_tables() {
    let pool = common::get_pg_pool().await;
    teardown(&pool).await;

    let migrator = Migrator::new(pool.clone());
    let applied = migrator.run().await.expect("Should run migrations");
    assert_eq!(applied, 1);

    for table in ["evolve_batched_migrations", "evolve_batched_jobs"] {
        let result: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM information_schema.tables
            WHERE table_name = $1
            "#,
        )
        .bind(table)
        .fetch_one(&pool)
        .await
        .expect("Failed to query information_schema");
        assert_eq!(result.0, 1, "{} should exist", table);
    }

    assert!(migrator.current_version().await.expect("version") >= 1);
    teardown(&pool).await;
}

#[tokio::test]
#[serial]
async fn migrator_is_idempotent() {
    let pool = common::get_pg_pool().await;
    teardown(&pool).await;

    let migrator = Migrator::new(pool.clone());
    let first = migrator.run().await.expect("first run");
    let second = migrator.run().await.expect("second run");

    assert_eq!(first, 1);
    assert_eq!(second, 0, "nothing should be pending on rerun");
    assert!(migrator.pending().await.expect("pending").is_empty());

    teardown(&pool).await;
}
