use pgrx::prelude::*;
use pgrx::IntoDatum;

use crate::config::{COMPOSITE_KEY_STRATEGY, DEBUG_RESOLVER, LOCK_DRAFT_ROWS};
use crate::dependency::{Discovery, DraftSource, RootLookup, RootRow};
use crate::error::{PublishError, PublishResult};
use crate::publish::StatementExecutor;
use crate::query::{CompositeStrategy, KeyTuple, Statement};
use crate::schema::PublishStatus;

/// Runs discovery and apply statements through SPI in the current transaction
#[derive(Debug, Clone, Copy)]
pub struct SpiStore {
    lock_rows: bool,
    strategy: CompositeStrategy,
}

impl Default for SpiStore {
    fn default() -> Self {
        Self {
            lock_rows: LOCK_DRAFT_ROWS,
            strategy: COMPOSITE_KEY_STRATEGY,
        }
    }
}

impl SpiStore {
    pub fn strategy(&self) -> CompositeStrategy {
        self.strategy
    }
}

fn text_args(params: &[String]) -> Vec<(PgOid, Option<pg_sys::Datum>)> {
    params
        .iter()
        .map(|p| (PgOid::BuiltIn(PgBuiltInOids::TEXTOID), p.as_str().into_datum()))
        .collect()
}

fn spi_error(statement: &Statement) -> impl FnOnce(pgrx::spi::Error) -> PublishError + '_ {
    move |e| PublishError::SpiError {
        query: statement.sql.clone(),
        error: e.to_string(),
    }
}

impl DraftSource for SpiStore {
    fn lookup_roots(&mut self, lookup: &RootLookup<'_>) -> PublishResult<Vec<RootRow>> {
        pgrx::check_for_interrupts!();

        let Some(statement) = lookup.statement(self.lock_rows)? else {
            return Ok(Vec::new());
        };
        let arity = lookup.entity.key_columns.len();

        let roots = Spi::connect(|mut client| {
            let rows = client.update(&statement.sql, None, Some(text_args(&statement.params)))?;
            let mut roots = Vec::with_capacity(rows.len());
            for row in rows {
                let mut values = Vec::with_capacity(arity);
                for ordinal in 1..=arity {
                    values.push(row.get::<String>(ordinal)?.unwrap_or_default());
                }
                let status = row.get::<bool>(arity + 1)?.map(|dirty| {
                    if dirty {
                        PublishStatus::Dirty
                    } else {
                        PublishStatus::Published
                    }
                });
                roots.push(RootRow {
                    key: KeyTuple::new(values),
                    status,
                });
            }
            Ok::<_, pgrx::spi::Error>(roots)
        })
        .map_err(spi_error(&statement))?;

        if DEBUG_RESOLVER {
            info!(
                "pg_publish: looked up {} root(s) of {}",
                roots.len(),
                lookup.entity.name
            );
        }

        Ok(roots)
    }

    fn discover(&mut self, discovery: &Discovery<'_>) -> PublishResult<Vec<KeyTuple>> {
        pgrx::check_for_interrupts!();

        let Some(statement) = discovery.statement(self.lock_rows, self.strategy)? else {
            return Ok(Vec::new());
        };
        let arity = discovery.target.key_columns.len();

        // read_only = false: FOR UPDATE is not allowed in a read-only SPI call
        let keys = Spi::connect(|mut client| {
            let rows = client.update(&statement.sql, None, Some(text_args(&statement.params)))?;
            let mut keys = Vec::with_capacity(rows.len());
            for row in rows {
                let mut values = Vec::with_capacity(arity);
                for ordinal in 1..=arity {
                    values.push(row.get::<String>(ordinal)?.unwrap_or_default());
                }
                keys.push(KeyTuple::new(values));
            }
            Ok::<_, pgrx::spi::Error>(keys)
        })
        .map_err(spi_error(&statement))?;

        if DEBUG_RESOLVER {
            info!(
                "pg_publish: {} found {} dirty {} row(s) for {} key(s)",
                discovery.label(),
                keys.len(),
                discovery.target.name,
                discovery.keys.len()
            );
        }

        Ok(keys)
    }
}

impl StatementExecutor for SpiStore {
    fn execute(&mut self, statement: &Statement) -> PublishResult<u64> {
        pgrx::check_for_interrupts!();

        if DEBUG_RESOLVER {
            info!("pg_publish: {}", statement.sql);
        }

        Spi::connect(|mut client| {
            let args = if statement.params.is_empty() {
                None
            } else {
                Some(text_args(&statement.params))
            };
            client.update(&statement.sql, None, args)?;
            // DML without RETURNING leaves no tuple table; the count lives in SPI_processed
            let processed = unsafe { pg_sys::SPI_processed };
            Ok::<_, pgrx::spi::Error>(processed)
        })
        .map_err(spi_error(statement))
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
    fn test_execute_reports_affected_rows() {
        Spi::run("CREATE TABLE st_rows (id INTEGER PRIMARY KEY, n INTEGER)").unwrap();
        Spi::run("INSERT INTO st_rows VALUES (1, 0), (2, 0), (3, 0)").unwrap();

        let statement = Statement::new(
            "UPDATE st_rows SET n = 1 WHERE id IN (CAST($1 AS integer), CAST($2 AS integer))",
            vec!["1".to_string(), "3".to_string()],
        );
        assert_eq!(SpiStore::default().execute(&statement), Ok(2));
        assert_eq!(
            Spi::get_one::<i64>("SELECT sum(n) FROM st_rows"),
            Ok(Some(2))
        );
    }

    #[pg_test]
    fn test_lookup_roots_reads_status_and_canonical_keys() {
        Spi::run(
            "CREATE TABLE st_orders (id INTEGER PRIMARY KEY, note TEXT);
             SELECT pg_publish_create_draft_table('st_orders');
             SELECT pg_publish_register_entity('st_orders', 'st_orders');
             INSERT INTO st_orders_draft (id, note, publish_status)
             VALUES (1, 'dirty', true), (2, 'clean', false);",
        )
        .unwrap();

        let registry = crate::catalog::load_registry().unwrap();
        let keys = [KeyTuple::from(["01"]), KeyTuple::from(["2"]), KeyTuple::from(["3"])];
        let lookup = RootLookup {
            entity: registry.lookup("st_orders").unwrap(),
            keys: &keys,
        };

        let mut rows = SpiStore::default().lookup_roots(&lookup).unwrap();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(
            rows,
            vec![
                RootRow { key: KeyTuple::from(["1"]), status: Some(PublishStatus::Dirty) },
                RootRow { key: KeyTuple::from(["2"]), status: Some(PublishStatus::Published) },
                RootRow { key: KeyTuple::from(["3"]), status: None },
            ]
        );
    }

    #[pg_test]
    fn test_execute_without_params() {
        let statement = Statement::new("SET CONSTRAINTS ALL DEFERRED", Vec::new());
        assert!(SpiStore::default().execute(&statement).is_ok());
    }
}
