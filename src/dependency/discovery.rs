//! Discovery queries: which DIRTY draft rows of a relationship's target are
//! linked to a set of source keys.
//!
//! Every query selects the target key as text, restricted to
//! `publish_status = true`, optionally locking the rows it returns.
//! [`RootLookup`] does the same for the roots themselves before expansion.

use crate::config::PUBLISH_STATUS_COLUMN;
use crate::error::{PublishError, PublishResult};
use crate::query::{column_list, column_ref, membership, CompositeStrategy, KeyTuple, Statement};
use crate::schema::{EntitySchema, PublishStatus, RelationKind, Relationship};
use crate::validation::quote_qualified;

/// One expansion step: follow `relation` from `source` rows with `keys`
#[derive(Debug, Clone, Copy)]
pub struct Discovery<'a> {
    pub source: &'a EntitySchema,
    pub relation: &'a Relationship,
    pub target: &'a EntitySchema,
    pub keys: &'a [KeyTuple],
}

impl Discovery<'_> {
    /// Render the discovery statement, or `None` for an empty key set
    pub fn statement(
        &self,
        lock: bool,
        strategy: CompositeStrategy,
    ) -> PublishResult<Option<Statement>> {
        let target_keys = self.target.key_names();
        let source_keys = self.source.key_names();

        let select = target_keys
            .iter()
            .map(|c| format!("{}::text", column_ref(Some("t"), c)))
            .collect::<Vec<_>>()
            .join(", ");

        let filter = match self.relation.kind {
            RelationKind::BelongsTo | RelationKind::HasMany => {
                let Some(pred) = membership(
                    Some("t"),
                    &self.relation.foreign_key,
                    &self.source.key_columns,
                    self.keys,
                    1,
                    strategy,
                )?
                else {
                    return Ok(None);
                };
                (pred.sql, pred.params)
            }
            RelationKind::HasOne => {
                let Some(pred) = membership(
                    Some("s"),
                    &source_keys,
                    &self.source.key_columns,
                    self.keys,
                    1,
                    strategy,
                )?
                else {
                    return Ok(None);
                };
                let sql = format!(
                    "{} IN (SELECT {} FROM {} s WHERE {})",
                    row_of(&target_keys),
                    column_list(Some("s"), &self.relation.foreign_key),
                    quote_qualified(&self.source.draft_table),
                    pred.sql
                );
                (sql, pred.params)
            }
            RelationKind::ManyToMany => {
                let Some(join) = self.relation.join_table.as_ref() else {
                    return Err(crate::internal_error!(
                        "many_to_many relationship '{}' without join table",
                        self.relation.name
                    ));
                };
                let Some(pred) = membership(
                    Some("j"),
                    &join.source_columns,
                    &self.source.key_columns,
                    self.keys,
                    1,
                    strategy,
                )?
                else {
                    return Ok(None);
                };
                let sql = format!(
                    "{} IN (SELECT {} FROM {} j WHERE {})",
                    row_of(&target_keys),
                    column_list(Some("j"), &join.target_columns),
                    quote_qualified(&join.table),
                    pred.sql
                );
                (sql, pred.params)
            }
        };

        let (predicate, params) = filter;
        let mut sql = format!(
            "SELECT {select} FROM {} t WHERE {predicate} AND {} = {} ORDER BY {}",
            quote_qualified(&self.target.draft_table),
            column_ref(Some("t"), PUBLISH_STATUS_COLUMN),
            PublishStatus::Dirty.as_sql(),
            column_list(Some("t"), &target_keys),
        );
        if lock {
            sql.push_str(" FOR UPDATE OF t");
        }

        Ok(Some(Statement::new(sql, params)))
    }

    /// `source.relation`, for log lines and errors
    pub fn label(&self) -> String {
        format!("{}.{}", self.source.name, self.relation.name)
    }
}

/// Draft state of the root keys of one entity, read before expansion
#[derive(Debug, Clone, Copy)]
pub struct RootLookup<'a> {
    pub entity: &'a EntitySchema,
    pub keys: &'a [KeyTuple],
}

/// A root key as the database renders it, with the status of its draft row
/// (`None` when the draft has no such row)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootRow {
    pub key: KeyTuple,
    pub status: Option<PublishStatus>,
}

impl RootLookup<'_> {
    /// Render the lookup, or `None` for an empty key set.
    ///
    /// Keys are cast to the key column types and read back as text, so
    /// `"05"` comes back as `"5"` and matches what discovery returns. Existing
    /// draft rows are locked when `lock` is set; missing ones still yield a
    /// row with a NULL status.
    pub fn statement(&self, lock: bool) -> PublishResult<Option<Statement>> {
        if self.keys.is_empty() {
            return Ok(None);
        }

        let columns = &self.entity.key_columns;
        let names = self.entity.key_names();
        let mut params = Vec::with_capacity(self.keys.len() * columns.len());
        let mut rows = Vec::with_capacity(self.keys.len());

        for key in self.keys {
            if key.arity() != columns.len() {
                return Err(PublishError::InvalidInput {
                    parameter: "key".to_string(),
                    value: key.to_string(),
                    reason: format!("expected {} value(s), got {}", columns.len(), key.arity()),
                });
            }
            let mut casts = Vec::with_capacity(columns.len());
            for (value, column) in key.values().iter().zip(columns) {
                params.push(value.clone());
                casts.push(format!("CAST(${} AS {})", params.len(), column.sql_type));
            }
            rows.push(format!("({})", casts.join(", ")));
        }

        let select = names
            .iter()
            .map(|c| format!("{}::text", column_ref(Some("k"), c)))
            .collect::<Vec<_>>()
            .join(", ");
        let join = names
            .iter()
            .map(|c| format!("{} = {}", column_ref(Some("t"), c), column_ref(Some("k"), c)))
            .collect::<Vec<_>>()
            .join(" AND ");
        let status = column_ref(Some("t"), PUBLISH_STATUS_COLUMN);
        let lock = if lock { " FOR UPDATE OF t" } else { "" };

        let sql = format!(
            "SELECT {select}, s.{} FROM (VALUES {}) AS k ({}) \
             LEFT JOIN LATERAL (SELECT {status} FROM {} t WHERE {join}{lock}) s ON true",
            column_ref(None, PUBLISH_STATUS_COLUMN),
            rows.join(", "),
            column_list(None, &names),
            quote_qualified(&self.entity.draft_table),
        );

        Ok(Some(Statement::new(sql, params)))
    }
}

/// `t."a"` for one column, `(t."a", t."b")` for several
fn row_of(columns: &[String]) -> String {
    if columns.len() == 1 {
        column_ref(Some("t"), &columns[0])
    } else {
        format!("({})", column_list(Some("t"), columns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::fixtures::shop_registry;
    use crate::schema::SchemaRegistry;

    fn discovery_sql(
        registry: &SchemaRegistry,
        source: &str,
        relation: &str,
        keys: &[KeyTuple],
        lock: bool,
    ) -> Option<Statement> {
        let source = registry.lookup(source).unwrap();
        let relation = source
            .relationships
            .iter()
            .find(|r| r.name == relation)
            .unwrap();
        let target = registry.entity(relation.target);

        Discovery { source, relation, target, keys }
            .statement(lock, CompositeStrategy::RowValues)
            .unwrap()
    }

    #[test]
    fn test_has_many_filters_target_by_foreign_key() {
        let registry = shop_registry();
        let stmt = discovery_sql(
            &registry,
            "orders",
            "line_items",
            &[KeyTuple::from(["5"])],
            true,
        )
        .unwrap();

        assert_eq!(
            stmt.sql,
            r#"SELECT t."id"::text FROM "line_items_draft" t WHERE t."order_id" IN (CAST($1 AS integer)) AND t."publish_status" = true ORDER BY t."id" FOR UPDATE OF t"#
        );
        assert_eq!(stmt.params, vec!["5"]);
    }

    #[test]
    fn test_has_one_selects_through_source_foreign_key() {
        let registry = shop_registry();
        let stmt = discovery_sql(
            &registry,
            "orders",
            "warehouse",
            &[KeyTuple::from(["5"])],
            false,
        )
        .unwrap();

        assert_eq!(
            stmt.sql,
            r#"SELECT t."id"::text FROM "warehouses_draft" t WHERE t."id" IN (SELECT s."warehouse_id" FROM "orders_draft" s WHERE s."id" IN (CAST($1 AS integer))) AND t."publish_status" = true ORDER BY t."id""#
        );
    }

    #[test]
    fn test_many_to_many_selects_through_join_table() {
        let registry = shop_registry();
        let stmt = discovery_sql(
            &registry,
            "orders",
            "tags",
            &[KeyTuple::from(["5"]), KeyTuple::from(["6"])],
            false,
        )
        .unwrap();

        assert_eq!(
            stmt.sql,
            r#"SELECT t."id"::text FROM "tags_draft" t WHERE t."id" IN (SELECT j."tag_id" FROM "order_tags_draft" j WHERE j."order_id" IN (CAST($1 AS integer), CAST($2 AS integer))) AND t."publish_status" = true ORDER BY t."id""#
        );
        assert_eq!(stmt.params, vec!["5", "6"]);
    }

    #[test]
    fn test_composite_foreign_key_uses_row_values() {
        let registry = shop_registry();
        let stmt = discovery_sql(
            &registry,
            "page_translations",
            "revisions",
            &[KeyTuple::from(["7", "en"])],
            false,
        )
        .unwrap();

        assert_eq!(
            stmt.sql,
            r#"SELECT t."id"::text FROM "translation_revisions_draft" t WHERE (t."page_id", t."locale") IN ((CAST($1 AS integer), CAST($2 AS text))) AND t."publish_status" = true ORDER BY t."id""#
        );
        assert_eq!(stmt.params, vec!["7", "en"]);
    }

    #[test]
    fn test_root_lookup_casts_and_locks() {
        let registry = shop_registry();
        let keys = [KeyTuple::from(["05"]), KeyTuple::from(["6"])];
        let stmt = RootLookup {
            entity: registry.lookup("orders").unwrap(),
            keys: &keys,
        }
        .statement(true)
        .unwrap()
        .unwrap();

        assert_eq!(
            stmt.sql,
            r#"SELECT k."id"::text, s."publish_status" FROM (VALUES (CAST($1 AS integer)), (CAST($2 AS integer))) AS k ("id") LEFT JOIN LATERAL (SELECT t."publish_status" FROM "orders_draft" t WHERE t."id" = k."id" FOR UPDATE OF t) s ON true"#
        );
        assert_eq!(stmt.params, vec!["05", "6"]);
    }

    #[test]
    fn test_root_lookup_composite_key() {
        let registry = shop_registry();
        let keys = [KeyTuple::from(["7", "en"])];
        let stmt = RootLookup {
            entity: registry.lookup("page_translations").unwrap(),
            keys: &keys,
        }
        .statement(false)
        .unwrap()
        .unwrap();

        assert_eq!(
            stmt.sql,
            r#"SELECT k."page_id"::text, k."locale"::text, s."publish_status" FROM (VALUES (CAST($1 AS integer), CAST($2 AS text))) AS k ("page_id", "locale") LEFT JOIN LATERAL (SELECT t."publish_status" FROM "page_translations_draft" t WHERE t."page_id" = k."page_id" AND t."locale" = k."locale") s ON true"#
        );
    }

    #[test]
    fn test_root_lookup_rejects_wrong_arity() {
        let registry = shop_registry();
        let keys = [KeyTuple::from(["7"])];
        let result = RootLookup {
            entity: registry.lookup("page_translations").unwrap(),
            keys: &keys,
        }
        .statement(true);

        assert_eq!(result.map_err(|e| e.sqlstate()), Err("22023"));
    }

    #[test]
    fn test_empty_keys_render_no_statement() {
        let registry = shop_registry();
        assert!(discovery_sql(&registry, "orders", "customer", &[], true).is_none());

        let lookup = RootLookup {
            entity: registry.lookup("orders").unwrap(),
            keys: &[],
        };
        assert_eq!(lookup.statement(true), Ok(None));
    }
}
