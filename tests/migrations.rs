use list_archiver::test_support::{TestDatabase, TestDatabaseError};
use sqlx::PgPool;
use sqlx::migrate::Migrator;

static ARCHIVE_MIGRATIONS: Migrator = sqlx::migrate!("./migrations");

const ARCHIVE_TABLES: &[&str] = &[
    "mailing_lists",
    "senders",
    "threads",
    "emails",
    "attachments",
    "votes",
    "favorites",
    "last_views",
    "tags",
    "taggings",
];

async fn existing_tables(pool: &PgPool) -> Vec<String> {
    let mut tables: Vec<String> = sqlx::query_scalar(
        "SELECT table_name::text FROM information_schema.tables WHERE table_schema = 'public' AND table_name::text = ANY($1)",
    )
    .bind(ARCHIVE_TABLES.iter().map(|t| t.to_string()).collect::<Vec<_>>())
    .fetch_all(pool)
    .await
    .expect("table lookup");
    tables.sort();
    tables
}

#[tokio::test]
async fn schema_reverts_and_reapplies() {
    let test_db = match TestDatabase::new_from_env().await {
        Ok(db) => db,
        Err(TestDatabaseError::MissingUrl) => {
            eprintln!("skipping migration test: TEST_DATABASE_URL not set");
            return;
        }
        Err(err) => panic!("failed to provision test database: {err:?}"),
    };
    let pool = test_db.pool_clone();

    let mut expected: Vec<String> = ARCHIVE_TABLES.iter().map(|t| t.to_string()).collect();
    expected.sort();
    assert_eq!(existing_tables(&pool).await, expected);

    ARCHIVE_MIGRATIONS.undo(&pool, 0).await.expect("migrations revert");
    assert!(existing_tables(&pool).await.is_empty());

    ARCHIVE_MIGRATIONS.run(&pool).await.expect("migrations rerun");
    assert_eq!(existing_tables(&pool).await, expected);

    test_db.close().await.expect("failed to drop test database");
}
