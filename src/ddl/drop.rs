use pgrx::prelude::*;

use crate::error::{PublishError, PublishResult};
use crate::schema::introspect::PgIntrospector;
use crate::schema::{draft_table_name, SchemaIntrospector};
use crate::validation::{quote_qualified, validate_qualified_name};

/// Drop the draft twin of a production table
///
/// If `if_exists` is true, no error is raised if the draft table doesn't
/// exist. Registrations in pg_publish_entity are left alone; the next
/// publish against that entity fails until a draft is created again.
///
/// # Errors
/// Returns error if the draft doesn't exist (unless `if_exists` is true) or
/// the drop fails
pub fn drop_draft_table(table: &str, if_exists: bool) -> PublishResult<bool> {
    validate_qualified_name(table, "table")?;
    let draft = draft_table_name(table);

    if !PgIntrospector.table_exists(&draft)? {
        if if_exists {
            return Ok(false);
        }
        return Err(PublishError::TableNotFound { table: draft });
    }

    let sql = format!("DROP TABLE {}", quote_qualified(&draft));
    Spi::run(&sql).map_err(|e| PublishError::SpiError {
        query: sql,
        error: e.to_string(),
    })?;

    info!("pg_publish: dropped draft table {}", draft);
    Ok(true)
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
    fn test_drop_draft_table() {
        Spi::run("CREATE TABLE ddl_drop (id INTEGER PRIMARY KEY)").unwrap();
        crate::ddl::create_draft_table("ddl_drop").unwrap();

        assert_eq!(drop_draft_table("ddl_drop", false), Ok(true));
        assert_eq!(PgIntrospector.table_exists("ddl_drop_draft"), Ok(false));
        assert_eq!(PgIntrospector.table_exists("ddl_drop"), Ok(true));
    }

    #[pg_test]
    fn test_drop_missing_draft() {
        assert_eq!(drop_draft_table("ddl_never", true), Ok(false));
        assert_error_sqlstate(drop_draft_table("ddl_never", false), "42P01");
    }
}
