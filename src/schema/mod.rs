//! Schema Registry: the explicit entity/relationship model publishing walks
//!
//! The registry is built once per operation from the registration rows in
//! `pg_publish_entity` / `pg_publish_relation` plus catalog introspection of
//! the registered tables:
//!
//! - **Entity**: table, draft twin, ordered primary-key columns (with types),
//!   scalar columns copied between the stores, publishable flag
//! - **Relationship**: kind, foreign-key columns, target entity and, for
//!   many_to_many, the join table descriptor
//! - **EntityId**: a dense tag assigned in entity-name order; all maps in the
//!   resolver and publisher are keyed by it
//!
//! Foreign-key placement follows the relationship kind:
//!
//! | kind           | `foreign_key` columns live on | discovery                                   |
//! |----------------|-------------------------------|---------------------------------------------|
//! | `belongs_to`   | target table                  | target rows whose fk is in the source keys  |
//! | `has_many`     | target table                  | same as `belongs_to`                        |
//! | `has_one`      | source table                  | target keys selected through the source fk  |
//! | `many_to_many` | join table                    | target keys selected through the join table |

pub mod introspect;

#[cfg(test)]
pub mod fixtures;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::catalog::{EntityMeta, RelationMeta};
use crate::config::{DRAFT_TABLE_SUFFIX, PUBLISH_STATUS_COLUMN};
use crate::error::{PublishError, PublishResult};
use crate::query::KeyColumn;
use crate::validation::{validate_column_list, validate_qualified_name, validate_sql_identifier};

/// Map a production table to its draft twin (`shop.orders` -> `shop.orders_draft`)
pub fn draft_table_name(table: &str) -> String {
    format!("{table}{DRAFT_TABLE_SUFFIX}")
}

/// Source of column metadata for registered tables
pub trait SchemaIntrospector {
    fn table_exists(&self, table: &str) -> PublishResult<bool>;

    /// Primary-key columns in key order, with their SQL types
    fn primary_key_columns(&self, table: &str) -> PublishResult<Vec<KeyColumn>>;

    /// Plain stored columns in attribute order (generated columns excluded)
    fn scalar_columns(&self, table: &str) -> PublishResult<Vec<String>>;
}

/// Stable per-operation tag for an entity type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(u32);

impl EntityId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    BelongsTo,
    HasOne,
    HasMany,
    ManyToMany,
}

impl RelationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            RelationKind::BelongsTo => "belongs_to",
            RelationKind::HasOne => "has_one",
            RelationKind::HasMany => "has_many",
            RelationKind::ManyToMany => "many_to_many",
        }
    }
}

impl FromStr for RelationKind {
    type Err = PublishError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "belongs_to" => Ok(RelationKind::BelongsTo),
            "has_one" => Ok(RelationKind::HasOne),
            "has_many" => Ok(RelationKind::HasMany),
            "many_to_many" => Ok(RelationKind::ManyToMany),
            other => Err(PublishError::UnsupportedRelationKind {
                kind: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Draft row status, persisted in the draft-only status column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStatus {
    /// Edited since the last publish (`true`)
    Dirty,
    /// Identical to production (`false`)
    Published,
}

impl PublishStatus {
    pub const fn as_sql(self) -> &'static str {
        match self {
            PublishStatus::Dirty => "true",
            PublishStatus::Published => "false",
        }
    }
}

/// Join table of a many_to_many relationship
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTable {
    pub table: String,
    /// Columns matching the source entity's key, in key order
    pub source_columns: Vec<String>,
    /// Columns matching the target entity's key, in key order
    pub target_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    pub name: String,
    pub kind: RelationKind,
    pub foreign_key: Vec<String>,
    pub target: EntityId,
    pub join_table: Option<JoinTable>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySchema {
    pub id: EntityId,
    pub name: String,
    pub table: String,
    pub draft_table: String,
    pub key_columns: Vec<KeyColumn>,
    pub scalar_columns: Vec<String>,
    pub relationships: Vec<Relationship>,
    pub publishable: bool,
}

impl EntitySchema {
    pub fn key_names(&self) -> Vec<String> {
        crate::query::key_names(&self.key_columns)
    }
}

/// All registered entities of one operation, indexed by [`EntityId`]
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    entities: Vec<EntitySchema>,
    by_name: HashMap<String, EntityId>,
}

impl SchemaRegistry {
    /// Build the registry from registration rows, introspecting every table.
    ///
    /// Fails fast on unknown targets, missing tables or keys, arity mismatches
    /// and draft/production column drift.
    pub fn build(
        entities: &[EntityMeta],
        relations: &[RelationMeta],
        introspector: &dyn SchemaIntrospector,
    ) -> PublishResult<Self> {
        let mut metas: Vec<&EntityMeta> = entities.iter().collect();
        metas.sort_by(|a, b| a.entity.cmp(&b.entity));

        let mut registry = SchemaRegistry::default();

        for (idx, meta) in metas.iter().enumerate() {
            let id = EntityId(u32::try_from(idx).map_err(|_| {
                crate::internal_error!("more than u32::MAX registered entities")
            })?);
            let schema = load_entity(id, meta, introspector)?;
            registry.by_name.insert(schema.name.clone(), id);
            registry.entities.push(schema);
        }

        for relation in relations {
            let source_id = registry.id_of(&relation.entity)?;
            let resolved = registry.resolve_relation(source_id, relation, introspector)?;
            registry.entities[source_id.index()].relationships.push(resolved);
        }

        for schema in &mut registry.entities {
            schema.relationships.sort_by(|a, b| a.name.cmp(&b.name));
        }

        Ok(registry)
    }

    pub fn entity(&self, id: EntityId) -> &EntitySchema {
        &self.entities[id.index()]
    }

    pub fn id_of(&self, name: &str) -> PublishResult<EntityId> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| PublishError::MetadataNotFound {
                entity: name.to_string(),
            })
    }

    pub fn lookup(&self, name: &str) -> PublishResult<&EntitySchema> {
        self.id_of(name).map(|id| self.entity(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntitySchema> {
        self.entities.iter()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    fn resolve_relation(
        &self,
        source_id: EntityId,
        meta: &RelationMeta,
        introspector: &dyn SchemaIntrospector,
    ) -> PublishResult<Relationship> {
        let source = self.entity(source_id);
        let target_id = self.id_of(&meta.target)?;
        let target = self.entity(target_id);
        let kind: RelationKind = meta.kind.parse()?;
        let label = format!("{}.{}", source.name, meta.name);

        validate_sql_identifier(&meta.name, "relation name")?;

        let join_table = match kind {
            RelationKind::BelongsTo | RelationKind::HasMany => {
                validate_column_list(&meta.foreign_key, "foreign_key")?;
                check_arity(&label, source.key_columns.len(), meta.foreign_key.len())?;
                check_columns_exist(&label, &target.scalar_columns, &meta.foreign_key)?;
                None
            }
            RelationKind::HasOne => {
                validate_column_list(&meta.foreign_key, "foreign_key")?;
                check_arity(&label, target.key_columns.len(), meta.foreign_key.len())?;
                check_columns_exist(&label, &source.scalar_columns, &meta.foreign_key)?;
                None
            }
            RelationKind::ManyToMany => {
                let table = meta.join_table.clone().ok_or_else(|| PublishError::InvalidInput {
                    parameter: "join_table".to_string(),
                    value: label.clone(),
                    reason: "many_to_many relationships require a join table".to_string(),
                })?;
                validate_qualified_name(&table, "join_table")?;
                validate_column_list(&meta.join_source_key, "join_source_key")?;
                validate_column_list(&meta.join_target_key, "join_target_key")?;
                check_arity(&label, source.key_columns.len(), meta.join_source_key.len())?;
                check_arity(&label, target.key_columns.len(), meta.join_target_key.len())?;

                if !introspector.table_exists(&table)? {
                    return Err(PublishError::TableNotFound { table });
                }
                let join_columns = introspector.scalar_columns(&table)?;
                check_columns_exist(&label, &join_columns, &meta.join_source_key)?;
                check_columns_exist(&label, &join_columns, &meta.join_target_key)?;

                Some(JoinTable {
                    table,
                    source_columns: meta.join_source_key.clone(),
                    target_columns: meta.join_target_key.clone(),
                })
            }
        };

        Ok(Relationship {
            name: meta.name.clone(),
            kind,
            foreign_key: meta.foreign_key.clone(),
            target: target_id,
            join_table,
        })
    }
}

fn load_entity(
    id: EntityId,
    meta: &EntityMeta,
    introspector: &dyn SchemaIntrospector,
) -> PublishResult<EntitySchema> {
    validate_sql_identifier(&meta.entity, "entity")?;
    validate_qualified_name(&meta.table_name, "table_name")?;

    let draft_table = draft_table_name(&meta.table_name);
    if !introspector.table_exists(&meta.table_name)? {
        return Err(PublishError::TableNotFound {
            table: meta.table_name.clone(),
        });
    }

    let key_columns = introspector.primary_key_columns(&meta.table_name)?;
    if key_columns.is_empty() {
        return Err(PublishError::MissingPrimaryKey {
            table: meta.table_name.clone(),
        });
    }

    let scalar_columns = introspector.scalar_columns(&meta.table_name)?;

    // Non-publishable entities are only ever relationship targets that the
    // resolver skips; they need no draft twin.
    if meta.publishable {
        if !introspector.table_exists(&draft_table)? {
            return Err(PublishError::TableNotFound { table: draft_table });
        }
        let draft_columns = introspector.scalar_columns(&draft_table)?;
        check_draft_matches(&meta.entity, &scalar_columns, &draft_columns)?;
    }

    Ok(EntitySchema {
        id,
        name: meta.entity.clone(),
        table: meta.table_name.clone(),
        draft_table,
        key_columns,
        scalar_columns,
        relationships: Vec::new(),
        publishable: meta.publishable,
    })
}

/// Draft = production columns + publish_status, nothing else
fn check_draft_matches(
    entity: &str,
    production: &[String],
    draft: &[String],
) -> PublishResult<()> {
    if !draft.iter().any(|c| c == PUBLISH_STATUS_COLUMN) {
        return Err(PublishError::SchemaMismatch {
            entity: entity.to_string(),
            reason: format!("draft table has no '{PUBLISH_STATUS_COLUMN}' column"),
        });
    }
    if production.iter().any(|c| c == PUBLISH_STATUS_COLUMN) {
        return Err(PublishError::SchemaMismatch {
            entity: entity.to_string(),
            reason: format!("production table must not carry '{PUBLISH_STATUS_COLUMN}'"),
        });
    }

    let prod: BTreeSet<&str> = production.iter().map(String::as_str).collect();
    let drafted: BTreeSet<&str> = draft
        .iter()
        .map(String::as_str)
        .filter(|c| *c != PUBLISH_STATUS_COLUMN)
        .collect();

    let missing: Vec<&str> = prod.difference(&drafted).copied().collect();
    let extra: Vec<&str> = drafted.difference(&prod).copied().collect();

    if !missing.is_empty() || !extra.is_empty() {
        let mut reason = Vec::new();
        if !missing.is_empty() {
            reason.push(format!("missing in draft: {}", missing.join(", ")));
        }
        if !extra.is_empty() {
            reason.push(format!("only in draft: {}", extra.join(", ")));
        }
        return Err(PublishError::SchemaMismatch {
            entity: entity.to_string(),
            reason: reason.join("; "),
        });
    }

    Ok(())
}

fn check_arity(relation: &str, expected: usize, found: usize) -> PublishResult<()> {
    if expected != found {
        return Err(PublishError::RelationshipArityMismatch {
            relation: relation.to_string(),
            expected,
            found,
        });
    }
    Ok(())
}

fn check_columns_exist(relation: &str, available: &[String], wanted: &[String]) -> PublishResult<()> {
    for column in wanted {
        if !available.contains(column) {
            return Err(PublishError::InvalidInput {
                parameter: "foreign_key".to_string(),
                value: column.clone(),
                reason: format!("column not found for relationship '{relation}'"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::fixtures::{shop_entities, shop_relations, StaticIntrospector};
    use super::*;
    use crate::error::testing::{assert_error_contains, assert_error_sqlstate};

    #[test]
    fn test_draft_table_name_keeps_schema() {
        assert_eq!(draft_table_name("orders"), "orders_draft");
        assert_eq!(draft_table_name("shop.orders"), "shop.orders_draft");
    }

    #[test]
    fn test_relation_kind_parse() {
        assert_eq!("has_many".parse::<RelationKind>().unwrap(), RelationKind::HasMany);
        assert_eq!("many_to_many".parse::<RelationKind>().unwrap(), RelationKind::ManyToMany);
        assert_error_sqlstate("polymorphic".parse::<RelationKind>(), "0A000");
    }

    #[test]
    fn test_build_assigns_ids_in_name_order() {
        let registry = SchemaRegistry::build(
            &shop_entities(),
            &shop_relations(),
            &StaticIntrospector::shop(),
        )
        .unwrap();

        let names: Vec<&str> = registry.iter().map(|e| e.name.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        assert_eq!(names, sorted);

        let orders = registry.lookup("orders").unwrap();
        assert_eq!(orders.draft_table, "orders_draft");
        assert_eq!(orders.key_names(), vec!["id"]);
        assert_eq!(orders.relationships.len(), 4);
        assert!(!registry.lookup("warehouses").unwrap().publishable);
        assert_eq!(registry.entity(orders.id).name, "orders");
    }

    #[test]
    fn test_unknown_entity_lookup_fails() {
        let registry = SchemaRegistry::build(
            &shop_entities(),
            &shop_relations(),
            &StaticIntrospector::shop(),
        )
        .unwrap();

        assert_error_sqlstate(registry.id_of("invoices"), "P0001");
    }

    #[test]
    fn test_draft_column_drift_is_rejected() {
        let mut introspector = StaticIntrospector::shop();
        introspector.set_columns("customers_draft", &["id", "order_id", "publish_status"]);

        let result = SchemaRegistry::build(&shop_entities(), &shop_relations(), &introspector);
        assert_error_contains(result, "missing in draft: name");
    }

    #[test]
    fn test_draft_without_status_is_rejected() {
        let mut introspector = StaticIntrospector::shop();
        introspector.set_columns("orders_draft", &["id", "note"]);

        let result = SchemaRegistry::build(&shop_entities(), &shop_relations(), &introspector);
        assert_error_contains(result, "no 'publish_status' column");
    }

    #[test]
    fn test_missing_primary_key_is_rejected() {
        let mut introspector = StaticIntrospector::shop();
        introspector.set_key("orders", &[]);

        let result = SchemaRegistry::build(&shop_entities(), &shop_relations(), &introspector);
        assert_error_sqlstate(result, "42P10");
    }

    #[test]
    fn test_missing_draft_table_is_rejected() {
        let mut introspector = StaticIntrospector::shop();
        introspector.drop_table("line_items_draft");

        let result = SchemaRegistry::build(&shop_entities(), &shop_relations(), &introspector);
        assert_error_contains(result, "line_items_draft");
    }

    #[test]
    fn test_relation_arity_is_checked() {
        let mut relations = shop_relations();
        relations[0].foreign_key = vec!["order_id".to_string(), "name".to_string()];

        let result = SchemaRegistry::build(&shop_entities(), &relations, &StaticIntrospector::shop());
        assert_error_sqlstate(result, "42830");
    }

    #[test]
    fn test_relation_to_unregistered_target_fails() {
        let mut relations = shop_relations();
        relations[0].target = "invoices".to_string();

        let result = SchemaRegistry::build(&shop_entities(), &relations, &StaticIntrospector::shop());
        assert_error_contains(result, "invoices");
    }

    #[test]
    fn test_many_to_many_requires_join_table() {
        let mut relations = shop_relations();
        relations.push(RelationMeta {
            entity: "orders".to_string(),
            name: "labels".to_string(),
            kind: "many_to_many".to_string(),
            target: "customers".to_string(),
            foreign_key: vec![],
            join_table: None,
            join_source_key: vec!["order_id".to_string()],
            join_target_key: vec!["customer_id".to_string()],
        });

        let result = SchemaRegistry::build(&shop_entities(), &relations, &StaticIntrospector::shop());
        assert_error_contains(result, "require a join table");
    }
}
