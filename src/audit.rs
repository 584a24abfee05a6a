use pgrx::prelude::*;
use pgrx::IntoDatum;

use crate::error::{PublishError, PublishResult};
use crate::publish::ApplyReport;

/// Append a publish/discard to pg_publish_log
pub fn log_apply(report: &ApplyReport) -> PublishResult<()> {
    let entities = serde_json::to_string(&report.entities)?;

    Spi::connect(|mut client| {
        client.update(
            "INSERT INTO pg_publish_log (operation, entities) VALUES ($1, $2::jsonb)",
            None,
            Some(vec![
                (PgOid::BuiltIn(PgBuiltInOids::TEXTOID), report.operation.as_str().into_datum()),
                (PgOid::BuiltIn(PgBuiltInOids::TEXTOID), entities.into_datum()),
            ]),
        )?;
        Ok::<_, pgrx::spi::Error>(())
    })
    .map_err(|e| PublishError::CatalogError {
        operation: "insert pg_publish_log".to_string(),
        pg_error: e.to_string(),
    })
}

#[cfg(feature = "pg_test")]
#[pg_schema]
mod tests {
    use std::collections::BTreeMap;

    use pgrx::prelude::*;
    use super::*;
    use crate::publish::{Direction, EntityReport};

    #[cfg(feature = "pg_test")]
    use pgrx_tests::pg_test;

    #[pg_test]
    fn test_log_apply_records_entities() {
        let mut entities = BTreeMap::new();
        entities.insert(
            "orders".to_string(),
            EntityReport {
                keys: 1,
                deleted: 0,
                inserted: 1,
                marked_published: 1,
            },
        );
        let report = ApplyReport {
            operation: Direction::Publish,
            entities,
            statements: 3,
            cyclic: false,
            elapsed_ms: 0,
            performed_at: chrono::Utc::now(),
        };

        log_apply(&report).unwrap();

        let row = Spi::get_two::<String, i64>(
            "SELECT operation, (entities->'orders'->>'inserted')::bigint
             FROM pg_publish_log ORDER BY id DESC LIMIT 1",
        );
        assert_eq!(row, Ok((Some("publish".to_string()), Some(1))));
    }
}
