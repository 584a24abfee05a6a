use pgrx::prelude::*;
use pgrx::IntoDatum;

use crate::error::{PublishError, PublishResult};
use crate::query::KeyColumn;
use crate::schema::SchemaIntrospector;
use crate::validation::quote_qualified;

const TABLE_EXISTS_SQL: &str = "SELECT to_regclass($1) IS NOT NULL";

const PRIMARY_KEY_SQL: &str = "\
    SELECT a.attname::text, format_type(a.atttypid, a.atttypmod) \
    FROM pg_index i \
    JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
    WHERE i.indrelid = $1::regclass AND i.indisprimary \
    ORDER BY array_position(i.indkey::int2[], a.attnum)";

const SCALAR_COLUMNS_SQL: &str = "\
    SELECT a.attname::text \
    FROM pg_attribute a \
    WHERE a.attrelid = $1::regclass \
      AND a.attnum > 0 \
      AND NOT a.attisdropped \
      AND a.attgenerated = '' \
    ORDER BY a.attnum";

/// Reads key and column metadata from pg_catalog through SPI
#[derive(Debug, Default, Clone, Copy)]
pub struct PgIntrospector;

/// The table as a regclass literal: quoted, so `MixedCase` is not folded to `mixedcase`
fn table_arg(table: &str) -> Vec<(PgOid, Option<pg_sys::Datum>)> {
    vec![(PgOid::BuiltIn(PgBuiltInOids::TEXTOID), quote_qualified(table).into_datum())]
}

fn catalog_error(operation: &str, table: &str, e: impl std::fmt::Display) -> PublishError {
    PublishError::CatalogError {
        operation: format!("{operation} for '{table}'"),
        pg_error: e.to_string(),
    }
}

impl SchemaIntrospector for PgIntrospector {
    fn table_exists(&self, table: &str) -> PublishResult<bool> {
        Spi::get_one_with_args::<bool>(TABLE_EXISTS_SQL, table_arg(table))
            .map(|found| found.unwrap_or(false))
            .map_err(|e| catalog_error("table lookup", table, e))
    }

    fn primary_key_columns(&self, table: &str) -> PublishResult<Vec<KeyColumn>> {
        Spi::connect(|client| {
            let rows = client.select(PRIMARY_KEY_SQL, None, Some(table_arg(table)))?;
            let mut columns = Vec::with_capacity(rows.len());
            for row in rows {
                let name = row.get::<String>(1)?.unwrap_or_default();
                let sql_type = row.get::<String>(2)?.unwrap_or_default();
                columns.push(KeyColumn::new(name, sql_type));
            }
            Ok::<_, pgrx::spi::Error>(columns)
        })
        .map_err(|e| catalog_error("primary key lookup", table, e))
    }

    fn scalar_columns(&self, table: &str) -> PublishResult<Vec<String>> {
        Spi::connect(|client| {
            let rows = client.select(SCALAR_COLUMNS_SQL, None, Some(table_arg(table)))?;
            let mut columns = Vec::with_capacity(rows.len());
            for row in rows {
                if let Some(name) = row.get::<String>(1)? {
                    columns.push(name);
                }
            }
            Ok::<_, pgrx::spi::Error>(columns)
        })
        .map_err(|e| catalog_error("column lookup", table, e))
    }
}

#[cfg(feature = "pg_test")]
#[pg_schema]
mod tests {
    use pgrx::prelude::*;
    use super::*;

    #[cfg(feature = "pg_test")]
    use pgrx_tests::pg_test;

    #[pg_test]
    fn test_primary_key_in_key_order() {
        Spi::run(
            "CREATE TABLE it_translations (
                body TEXT,
                locale TEXT NOT NULL,
                page_id INTEGER NOT NULL,
                PRIMARY KEY (page_id, locale)
            )",
        )
        .unwrap();

        let key = PgIntrospector.primary_key_columns("it_translations").unwrap();
        assert_eq!(
            key,
            vec![KeyColumn::new("page_id", "integer"), KeyColumn::new("locale", "text")]
        );
    }

    #[pg_test]
    fn test_scalar_columns_skip_generated_and_dropped() {
        Spi::run(
            "CREATE TABLE it_items (
                id BIGINT PRIMARY KEY,
                price NUMERIC(10,2),
                gone TEXT,
                doubled NUMERIC GENERATED ALWAYS AS (price * 2) STORED
            )",
        )
        .unwrap();
        Spi::run("ALTER TABLE it_items DROP COLUMN gone").unwrap();

        let columns = PgIntrospector.scalar_columns("it_items").unwrap();
        assert_eq!(columns, vec!["id".to_string(), "price".to_string()]);
    }

    #[pg_test]
    fn test_table_exists() {
        Spi::run("CREATE TABLE it_exists (id INTEGER PRIMARY KEY)").unwrap();

        assert_eq!(PgIntrospector.table_exists("it_exists"), Ok(true));
        assert_eq!(PgIntrospector.table_exists("it_missing"), Ok(false));
    }

    #[pg_test]
    fn test_mixed_case_table_is_found() {
        Spi::run(r#"CREATE TABLE "ItOrders" ("Id" INTEGER PRIMARY KEY, "Note" TEXT)"#).unwrap();
        Spi::run("CREATE TABLE itorders (id INTEGER PRIMARY KEY)").unwrap();

        assert_eq!(PgIntrospector.table_exists("ItOrders"), Ok(true));
        assert_eq!(
            PgIntrospector.primary_key_columns("ItOrders").unwrap(),
            vec![KeyColumn::new("Id", "integer")]
        );
        assert_eq!(
            PgIntrospector.scalar_columns("ItOrders").unwrap(),
            vec!["Id".to_string(), "Note".to_string()]
        );
        assert_eq!(PgIntrospector.table_exists("ITORDERS"), Ok(false));
    }

    #[pg_test]
    fn test_table_without_key_has_no_key_columns() {
        Spi::run("CREATE TABLE it_heap (id INTEGER)").unwrap();

        assert!(PgIntrospector.primary_key_columns("it_heap").unwrap().is_empty());
    }
}
