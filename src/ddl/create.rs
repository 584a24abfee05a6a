use pgrx::prelude::*;

use crate::config::PUBLISH_STATUS_COLUMN;
use crate::error::{PublishError, PublishResult};
use crate::schema::introspect::PgIntrospector;
use crate::schema::{draft_table_name, PublishStatus, SchemaIntrospector};
use crate::validation::{quote_ident, quote_qualified, validate_qualified_name};

/// Create the draft twin of a production table
///
/// Steps:
/// 1. Check the production table exists and the draft does not
/// 2. `CREATE TABLE <table>_draft (LIKE <table> ...)` copying defaults,
///    CHECK constraints and indexes (including the primary key)
/// 3. Add the `publish_status` column (DIRTY by default)
/// 4. Copy the current production rows in as PUBLISHED
///
/// Returns the draft table name.
pub fn create_draft_table(table: &str) -> PublishResult<String> {
    validate_qualified_name(table, "table")?;
    let draft = draft_table_name(table);

    let introspector = PgIntrospector;
    if !introspector.table_exists(table)? {
        return Err(PublishError::TableNotFound {
            table: table.to_string(),
        });
    }
    if introspector.table_exists(&draft)? {
        return Err(PublishError::InvalidInput {
            parameter: "table".to_string(),
            value: table.to_string(),
            reason: format!("draft table '{draft}' already exists"),
        });
    }

    let columns = introspector.scalar_columns(table)?;
    if columns.iter().any(|c| c == PUBLISH_STATUS_COLUMN) {
        return Err(PublishError::SchemaMismatch {
            entity: table.to_string(),
            reason: format!("production table must not carry '{PUBLISH_STATUS_COLUMN}'"),
        });
    }

    let statements = [
        format!(
            "CREATE TABLE {} (LIKE {} INCLUDING DEFAULTS INCLUDING CONSTRAINTS INCLUDING INDEXES)",
            quote_qualified(&draft),
            quote_qualified(table)
        ),
        format!(
            "ALTER TABLE {} ADD COLUMN {} boolean NOT NULL DEFAULT {}",
            quote_qualified(&draft),
            quote_ident(PUBLISH_STATUS_COLUMN),
            PublishStatus::Dirty.as_sql()
        ),
        format!(
            "INSERT INTO {draft_q} ({cols}, {status}) SELECT {cols}, {published} FROM {prod_q}",
            draft_q = quote_qualified(&draft),
            prod_q = quote_qualified(table),
            cols = crate::query::column_list(None, &columns),
            status = quote_ident(PUBLISH_STATUS_COLUMN),
            published = PublishStatus::Published.as_sql(),
        ),
    ];

    for sql in statements {
        Spi::run(&sql).map_err(|e| PublishError::SpiError {
            query: sql.clone(),
            error: e.to_string(),
        })?;
    }

    info!("pg_publish: created draft table {} for {}", draft, table);
    Ok(draft)
}

#[cfg(feature = "pg_test")]
#[pg_schema]
mod tests {
    use pgrx::prelude::*;
    use super::*;
    use crate::error::testing::assert_error_sqlstate;

    #[cfg(feature = "pg_test")]
    use pgrx_tests::pg_test;

    #[pg_test]
    fn test_create_draft_table_copies_rows_as_published() {
        Spi::run(
            "CREATE TABLE ddl_books (
                id INTEGER PRIMARY KEY,
                title TEXT NOT NULL CHECK (title <> ''),
                pages INTEGER DEFAULT 100
            )",
        )
        .unwrap();
        Spi::run("INSERT INTO ddl_books (id, title) VALUES (1, 'Dune'), (2, 'Emma')").unwrap();

        assert_eq!(create_draft_table("ddl_books"), Ok("ddl_books_draft".to_string()));

        let published = Spi::get_one::<i64>(
            "SELECT count(*) FROM ddl_books_draft WHERE publish_status = false",
        );
        assert_eq!(published, Ok(Some(2)));

        Spi::run("INSERT INTO ddl_books_draft (id, title) VALUES (3, 'Ulysses')").unwrap();
        let row = Spi::get_two::<i32, bool>(
            "SELECT pages, publish_status FROM ddl_books_draft WHERE id = 3",
        );
        assert_eq!(row, Ok((Some(100), Some(true))));

        // CHECK constraints come along with LIKE ... INCLUDING CONSTRAINTS
        Spi::run(
            "DO $$
             BEGIN
                 INSERT INTO ddl_books_draft (id, title) VALUES (4, '');
                 RAISE EXCEPTION 'check constraint missing on draft';
             EXCEPTION WHEN check_violation THEN
                 NULL;
             END $$",
        )
        .unwrap();
    }

    #[pg_test]
    fn test_create_draft_table_twice_fails() {
        Spi::run("CREATE TABLE ddl_twice (id INTEGER PRIMARY KEY)").unwrap();

        create_draft_table("ddl_twice").unwrap();
        assert_error_sqlstate(create_draft_table("ddl_twice"), "22023");
    }

    #[pg_test]
    fn test_create_draft_for_missing_table_fails() {
        assert_error_sqlstate(create_draft_table("ddl_nope"), "42P01");
    }
}
