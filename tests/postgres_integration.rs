//! Checks against a live PostgreSQL server.
//!
//! Skipped unless `DBCONNECTOR_TEST_PG_HOST` is set; see `common::server_config`
//! for the other variables.

mod common;

use common::{bounded, factory, scratch_table, server_config};
use dbconnector::{ConnectionType, DatabaseConnector, IndexOptions, Params, PostgresConnection, Value};

fn connection() -> Option<PostgresConnection> {
    let config = server_config("DBCONNECTOR_TEST_PG", 5432)?;
    Some(
        factory()
            .create_postgres_connection(ConnectionType::Direct, &config, None)
            .expect("postgres connection"),
    )
}

#[tokio::test]
async fn postgres_helpers_and_metadata() {
    let Some(pg) = connection() else {
        eprintln!("DBCONNECTOR_TEST_PG_HOST not set, skipping");
        return;
    };

    bounded(async {
        pg.connect().await.expect("connect");
        let table = scratch_table("orders");

        pg.execute(
            &format!("CREATE TABLE {} (id SERIAL PRIMARY KEY, customer_id INT NOT NULL)", table),
            &Params::new(),
        )
        .await
        .expect("create table");

        let version = pg.get_server_version().await.expect("version");
        assert!(version.is_some());
        assert!(pg
            .get_schema_names()
            .await
            .expect("schemas")
            .contains(&"public".to_string()));

        let index = pg
            .create_index(&table, &["customer_id"], IndexOptions::default())
            .await
            .expect("index");
        assert_eq!(index, format!("idx_{}_customer_id", table));

        let info = pg.get_table_info(&table, None).await.expect("table info");
        assert_eq!(info.columns.len(), 2);
        assert_eq!(info.primary_keys.len(), 1);
        assert_eq!(info.primary_keys[0]["column_name"], Value::Text("id".into()));
        assert_eq!(info.indexes.len(), 2);

        pg.vacuum_table(&table, None).await.expect("vacuum");

        pg.execute(&format!("DROP TABLE {}", table), &Params::new())
            .await
            .expect("drop");
        pg.disconnect().await.expect("disconnect");
    })
    .await;
}

#[tokio::test]
async fn postgres_transaction_rollback() {
    let Some(pg) = connection() else {
        eprintln!("DBCONNECTOR_TEST_PG_HOST not set, skipping");
        return;
    };

    bounded(async {
        let connector = DatabaseConnector::new(pg);
        connector.connect().await.expect("connect");
        let table = scratch_table("ledger");

        connector
            .execute_query(&format!("CREATE TABLE {} (amount BIGINT)", table), &Params::new())
            .await
            .expect("create");

        let statements = vec![
            (
                format!("INSERT INTO {} VALUES (:amount)", table),
                Params::new().with("amount", 10),
            ),
            (format!("INSERT INTO {} VALUES ('not a number')", table), Params::new()),
        ];
        let err = connector.execute_transaction(&statements).await.unwrap_err();
        assert!(err.is_transaction_error());

        let count = connector
            .execute_query(&format!("SELECT COUNT(*) AS n FROM {}", table), &Params::new())
            .await
            .expect("count");
        assert_eq!(count.get(0, "n"), Some(&Value::Int(0)));

        connector
            .execute_query(&format!("DROP TABLE {}", table), &Params::new())
            .await
            .expect("drop");
        connector.close().await.expect("close");
    })
    .await;
}
