//! End-to-end checks against real SQLite databases (in memory and on disk).

mod common;

use common::{bounded, factory};
use dbconnector::{
    ConnectionConfig, ConnectionFactory, DatabaseConnector, EngineError, Params, SqliteConnection, Value,
};

async fn memory_db(factory: &ConnectionFactory) -> SqliteConnection {
    let conn = factory.create_sqlite_connection(":memory:").expect("sqlite connection");
    conn.connect().await.expect("connect");
    conn.execute(
        "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL, qty INTEGER)",
        &Params::new(),
    )
    .await
    .expect("create table");
    conn
}

#[tokio::test]
async fn memory_database_round_trip() {
    bounded(async {
        let factory = factory();
        let conn = memory_db(&factory).await;

        let inserted = conn
            .execute(
                "INSERT INTO items (name, qty) VALUES (:name, :qty)",
                &Params::new().with("name", "bolt").with("qty", 12),
            )
            .await
            .expect("insert");
        assert_eq!(inserted.affected_rows, Some(1));
        assert_eq!(inserted.last_insert_id, Some(1));

        let records = conn
            .fetch_records("SELECT name, qty FROM items WHERE qty > :min", &Params::new().with("min", 10))
            .await
            .expect("select");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["name"], Value::Text("bolt".into()));
        assert_eq!(records[0]["qty"], Value::Int(12));

        conn.disconnect().await.expect("disconnect");
        assert!(!conn.is_connected().await);
    })
    .await;
}

#[tokio::test]
async fn missing_parameter_is_reported() {
    bounded(async {
        let factory = factory();
        let conn = memory_db(&factory).await;

        let err = conn
            .execute("SELECT * FROM items WHERE id = :id", &Params::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingParameter { .. }));
        assert!(err.is_query_error());
    })
    .await;
}

#[tokio::test]
async fn failed_transaction_leaves_no_rows() {
    bounded(async {
        let factory = factory();
        let conn = memory_db(&factory).await;
        let connector = DatabaseConnector::new(conn);

        let statements = vec![
            (
                "INSERT INTO items (name, qty) VALUES (:name, 1)".to_string(),
                Params::new().with("name", "nut"),
            ),
            ("INSERT INTO missing_table VALUES (1)".to_string(), Params::new()),
        ];
        let err = connector.execute_transaction(&statements).await.unwrap_err();
        assert!(err.is_transaction_error());
        assert!(err.to_string().starts_with("Transaction failed: "));

        let count = connector
            .execute_query("SELECT COUNT(*) AS n FROM items", &Params::new())
            .await
            .expect("count");
        assert_eq!(count.get(0, "n"), Some(&Value::Int(0)));
        assert!(!connector.connection().in_transaction().await);
    })
    .await;
}

#[tokio::test]
async fn committed_transaction_returns_each_result() {
    bounded(async {
        let factory = factory();
        let connector = DatabaseConnector::new(memory_db(&factory).await);

        let statements: Vec<(String, Params)> = ["washer", "screw"]
            .iter()
            .map(|name| {
                (
                    "INSERT INTO items (name, qty) VALUES (:name, 5)".to_string(),
                    Params::new().with("name", *name),
                )
            })
            .collect();
        let results = connector.execute_transaction(&statements).await.expect("transaction");

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.affected_rows == Some(1)));

        let total = connector
            .execute_query("SELECT SUM(qty) AS total FROM items", &Params::new())
            .await
            .expect("sum");
        assert_eq!(total.get(0, "total"), Some(&Value::Int(10)));
    })
    .await;
}

#[tokio::test]
async fn scoped_use_closes_the_connection() {
    bounded(async {
        let factory = factory();
        let connector = DatabaseConnector::new(
            factory.create_sqlite_connection(":memory:").expect("sqlite connection"),
        );

        let value = connector
            .scoped(|conn| {
                Box::pin(async move {
                    let result = conn.execute("SELECT 41 + 1 AS answer", &Params::new()).await?;
                    Ok(result.get(0, "answer").and_then(Value::as_i64))
                })
            })
            .await
            .expect("scoped");

        assert_eq!(value, Some(42));
        assert!(!connector.is_connected().await);
        assert!(factory.manager().list_sessions().await.is_empty());
    })
    .await;
}

#[tokio::test]
async fn sqlite_helpers() {
    bounded(async {
        let factory = factory();
        let conn = memory_db(&factory).await;

        assert!(conn.pragma("user_version", Some("7")).await.expect("set").is_none());
        let version = conn.pragma("user_version", None).await.expect("read").expect("rows");
        assert_eq!(version[0]["user_version"], Value::Int(7));

        let columns = conn.get_table_info("items").await.expect("table info");
        let names: Vec<_> = columns.iter().filter_map(|c| c["name"].as_str()).collect();
        assert_eq!(names, vec!["id", "name", "qty"]);

        let tables = conn.get_all_tables().await.expect("tables");
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0]["table_name"], Value::Text("items".into()));

        let sqlite_version = conn.get_sqlite_version().await.expect("version");
        assert!(sqlite_version.is_some_and(|v| v.starts_with('3')));

        conn.vacuum().await.expect("vacuum");
    })
    .await;
}

#[tokio::test]
async fn file_database_persists_across_connections() {
    bounded(async {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("inventory.db");
        let path = path.to_str().expect("utf-8 path");
        let factory = factory();

        let first = factory.create_sqlite_connection(path).expect("first");
        first.connect().await.expect("connect first");
        first
            .execute("CREATE TABLE notes (body TEXT)", &Params::new())
            .await
            .expect("create");
        first
            .execute("INSERT INTO notes VALUES (:body)", &Params::new().with("body", "kept"))
            .await
            .expect("insert");
        first.disconnect().await.expect("disconnect first");

        let second = factory.create_sqlite_connection(path).expect("second");
        second.connect().await.expect("connect second");
        let rows = second
            .fetch_records("SELECT body FROM notes", &Params::new())
            .await
            .expect("select");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["body"], Value::Text("kept".into()));
        second.disconnect().await.expect("disconnect second");
    })
    .await;
}

#[tokio::test]
async fn file_database_needs_an_existing_directory() {
    bounded(async {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("absent").join("app.db");
        let factory = factory();

        let conn = factory
            .create_sqlite_connection(path.to_str().expect("utf-8 path"))
            .expect("connection object");
        let err = conn.connect().await.unwrap_err();

        assert!(matches!(err, EngineError::InvalidConfig { .. }));
        assert!(err.to_string().contains("Directory for SQLite database does not exist"));
    })
    .await;
}

#[tokio::test]
async fn sqlite_rejects_remote_connections() {
    let factory = factory();
    let err = factory
        .create_connection("sqlite", "ssh", &ConnectionConfig::sqlite("app.db"), None)
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidConfig { .. }));
}
