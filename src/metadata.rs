use pgrx::prelude::*;
use crate::error::{PublishError, PublishResult};

// Registration and audit tables, created at CREATE EXTENSION time
extension_sql!(
    r"
    CREATE TABLE IF NOT EXISTS pg_publish_entity (
        entity TEXT NOT NULL PRIMARY KEY,
        table_name TEXT NOT NULL,
        publishable BOOLEAN NOT NULL DEFAULT TRUE,
        registered_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );

    CREATE TABLE IF NOT EXISTS pg_publish_relation (
        entity TEXT NOT NULL REFERENCES pg_publish_entity (entity) ON DELETE CASCADE,
        name TEXT NOT NULL,
        kind TEXT NOT NULL
            CHECK (kind IN ('belongs_to', 'has_one', 'has_many', 'many_to_many')),
        target TEXT NOT NULL REFERENCES pg_publish_entity (entity) ON DELETE CASCADE,
        foreign_key TEXT[] NOT NULL DEFAULT '{}',
        join_table TEXT,
        join_source_key TEXT[] NOT NULL DEFAULT '{}',
        join_target_key TEXT[] NOT NULL DEFAULT '{}',
        PRIMARY KEY (entity, name)
    );

    CREATE TABLE IF NOT EXISTS pg_publish_log (
        id BIGSERIAL PRIMARY KEY,
        operation TEXT NOT NULL,
        entities JSONB NOT NULL DEFAULT '{}',
        performed_by TEXT NOT NULL DEFAULT current_user,
        performed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );

    COMMENT ON TABLE pg_publish_entity IS 'Entities managed by pg_publish and their production tables';
    COMMENT ON TABLE pg_publish_relation IS 'Relationships followed when resolving publish dependencies';
    COMMENT ON TABLE pg_publish_log IS 'One row per publish or discard';
    ",
    name = "create_metadata_tables",
);

/// Check that the registration tables are installed
pub fn metadata_tables_exist() -> PublishResult<bool> {
    let found = Spi::get_one::<i64>(
        "SELECT COUNT(*) FROM pg_class
         WHERE relname IN ('pg_publish_entity', 'pg_publish_relation', 'pg_publish_log')
           AND relkind = 'r'",
    )
    .map_err(|e| PublishError::SpiError {
        query: "check pg_publish metadata tables".to_string(),
        error: e.to_string(),
    })?;

    Ok(found.unwrap_or(0) == 3)
}

#[cfg(feature = "pg_test")]
#[pg_schema]
mod tests {
    use pgrx::prelude::*;
    use super::*;

    #[cfg(feature = "pg_test")]
    use pgrx_tests::pg_test;

    #[pg_test]
    fn test_metadata_tables_exist() {
        assert_eq!(metadata_tables_exist(), Ok(true));
    }

    #[pg_test]
    fn test_relation_kind_is_constrained() {
        Spi::run(
            "INSERT INTO pg_publish_entity (entity, table_name) VALUES ('md_a', 'md_a')",
        )
        .unwrap();

        Spi::run(
            "DO $$
             BEGIN
                 INSERT INTO pg_publish_relation (entity, name, kind, target)
                 VALUES ('md_a', 'self', 'polymorphic', 'md_a');
                 RAISE EXCEPTION 'relation kind is not constrained';
             EXCEPTION WHEN check_violation THEN
                 NULL;
             END $$",
        )
        .unwrap();
    }

    #[pg_test]
    fn test_relation_columns() {
        let columns = Spi::connect(|client| {
            let mut columns = Vec::new();
            let query = "
                SELECT column_name::text, data_type::text, is_nullable::text
                FROM information_schema.columns
                WHERE table_name = 'pg_publish_relation'
                ORDER BY ordinal_position
            ";

            for row in client.select(query, None, None)? {
                let name: String = row.get(1)?.unwrap_or_default();
                let data_type: String = row.get(2)?.unwrap_or_default();
                let nullable: String = row.get(3)?.unwrap_or_default();
                columns.push((name, data_type, nullable));
            }

            Ok::<_, pgrx::spi::Error>(columns)
        })
        .expect("Failed to query column info");

        let expected = vec![
            ("entity", "text", "NO"),
            ("name", "text", "NO"),
            ("kind", "text", "NO"),
            ("target", "text", "NO"),
            ("foreign_key", "ARRAY", "NO"),
            ("join_table", "text", "YES"),
            ("join_source_key", "ARRAY", "NO"),
            ("join_target_key", "ARRAY", "NO"),
        ];

        for (name, data_type, nullable) in expected {
            assert!(
                columns.iter().any(|(n, t, null)| n == name && t == data_type && null == nullable),
                "Column {name} with type {data_type} nullable {nullable} not found"
            );
        }
    }
}
