use pgrx::prelude::*;
use pgrx::IntoDatum;
use serde::{Deserialize, Serialize};

use crate::error::{PublishError, PublishResult};
use crate::schema::introspect::PgIntrospector;
use crate::schema::{RelationKind, SchemaRegistry};
use crate::validation::{validate_qualified_name, validate_sql_identifier};

/// A row in pg_publish_entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMeta {
    pub entity: String,
    pub table_name: String,
    pub publishable: bool,
}

/// A row in pg_publish_relation.
///
/// Empty column lists stand for "not applicable" (foreign_key of a
/// many_to_many, join columns of the other kinds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationMeta {
    pub entity: String,
    pub name: String,
    pub kind: String,
    pub target: String,
    pub foreign_key: Vec<String>,
    pub join_table: Option<String>,
    pub join_source_key: Vec<String>,
    pub join_target_key: Vec<String>,
}

fn text(value: &str) -> (PgOid, Option<pg_sys::Datum>) {
    (PgOid::BuiltIn(PgBuiltInOids::TEXTOID), value.into_datum())
}

fn text_array(values: &[String]) -> (PgOid, Option<pg_sys::Datum>) {
    (PgOid::BuiltIn(PgBuiltInOids::TEXTARRAYOID), values.to_vec().into_datum())
}

fn catalog_error(operation: &str) -> impl FnOnce(pgrx::spi::Error) -> PublishError + '_ {
    move |e| PublishError::CatalogError {
        operation: operation.to_string(),
        pg_error: e.to_string(),
    }
}

impl EntityMeta {
    pub fn load_all() -> PublishResult<Vec<Self>> {
        Spi::connect(|client| {
            let rows = client.select(
                "SELECT entity, table_name, publishable \
                 FROM pg_publish_entity \
                 ORDER BY entity",
                None,
                None,
            )?;

            let mut result = Vec::with_capacity(rows.len());
            for row in rows {
                result.push(Self {
                    entity: row.get::<String>(1)?.unwrap_or_default(),
                    table_name: row.get::<String>(2)?.unwrap_or_default(),
                    publishable: row.get::<bool>(3)?.unwrap_or(false),
                });
            }
            Ok::<_, pgrx::spi::Error>(result)
        })
        .map_err(catalog_error("load pg_publish_entity"))
    }

    /// Insert or replace an entity registration
    pub fn upsert(&self) -> PublishResult<()> {
        validate_sql_identifier(&self.entity, "entity")?;
        validate_qualified_name(&self.table_name, "table_name")?;

        Spi::connect(|mut client| {
            client.update(
                "INSERT INTO pg_publish_entity (entity, table_name, publishable) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT (entity) DO UPDATE \
                 SET table_name = EXCLUDED.table_name, \
                     publishable = EXCLUDED.publishable, \
                     registered_at = now()",
                None,
                Some(vec![
                    text(&self.entity),
                    text(&self.table_name),
                    (PgOid::BuiltIn(PgBuiltInOids::BOOLOID), self.publishable.into_datum()),
                ]),
            )?;
            Ok::<_, pgrx::spi::Error>(())
        })
        .map_err(catalog_error("upsert pg_publish_entity"))
    }

    /// Remove an entity; its relationships (as source or target) cascade.
    /// Returns whether a registration existed.
    pub fn delete(entity: &str) -> PublishResult<bool> {
        Spi::connect(|mut client| {
            let deleted = client.update(
                "DELETE FROM pg_publish_entity WHERE entity = $1 RETURNING entity",
                None,
                Some(vec![text(entity)]),
            )?;
            Ok::<_, pgrx::spi::Error>(!deleted.is_empty())
        })
        .map_err(catalog_error("delete pg_publish_entity"))
    }
}

impl RelationMeta {
    pub fn load_all() -> PublishResult<Vec<Self>> {
        Spi::connect(|client| {
            let rows = client.select(
                "SELECT entity, name, kind, target, foreign_key, join_table, \
                        join_source_key, join_target_key \
                 FROM pg_publish_relation \
                 ORDER BY entity, name",
                None,
                None,
            )?;

            let mut result = Vec::with_capacity(rows.len());
            for row in rows {
                result.push(Self {
                    entity: row.get::<String>(1)?.unwrap_or_default(),
                    name: row.get::<String>(2)?.unwrap_or_default(),
                    kind: row.get::<String>(3)?.unwrap_or_default(),
                    target: row.get::<String>(4)?.unwrap_or_default(),
                    foreign_key: row.get::<Vec<String>>(5)?.unwrap_or_default(),
                    join_table: row.get::<String>(6)?,
                    join_source_key: row.get::<Vec<String>>(7)?.unwrap_or_default(),
                    join_target_key: row.get::<Vec<String>>(8)?.unwrap_or_default(),
                });
            }
            Ok::<_, pgrx::spi::Error>(result)
        })
        .map_err(catalog_error("load pg_publish_relation"))
    }

    /// Insert or replace a relationship registration
    pub fn upsert(&self) -> PublishResult<()> {
        validate_sql_identifier(&self.entity, "entity")?;
        validate_sql_identifier(&self.name, "name")?;
        validate_sql_identifier(&self.target, "target")?;
        let kind: RelationKind = self.kind.parse()?;

        let join_table_arg = match &self.join_table {
            Some(table) => text(table),
            None => (PgOid::BuiltIn(PgBuiltInOids::TEXTOID), None),
        };

        Spi::connect(|mut client| {
            client.update(
                "INSERT INTO pg_publish_relation \
                    (entity, name, kind, target, foreign_key, join_table, \
                     join_source_key, join_target_key) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                 ON CONFLICT (entity, name) DO UPDATE \
                 SET kind = EXCLUDED.kind, \
                     target = EXCLUDED.target, \
                     foreign_key = EXCLUDED.foreign_key, \
                     join_table = EXCLUDED.join_table, \
                     join_source_key = EXCLUDED.join_source_key, \
                     join_target_key = EXCLUDED.join_target_key",
                None,
                Some(vec![
                    text(&self.entity),
                    text(&self.name),
                    text(kind.as_str()),
                    text(&self.target),
                    text_array(&self.foreign_key),
                    join_table_arg,
                    text_array(&self.join_source_key),
                    text_array(&self.join_target_key),
                ]),
            )?;
            Ok::<_, pgrx::spi::Error>(())
        })
        .map_err(catalog_error("upsert pg_publish_relation"))
    }
}

/// Build the registry of the current registrations against the live catalog
pub fn load_registry() -> PublishResult<SchemaRegistry> {
    let entities = EntityMeta::load_all()?;
    let relations = RelationMeta::load_all()?;
    SchemaRegistry::build(&entities, &relations, &PgIntrospector)
}

#[cfg(feature = "pg_test")]
#[pg_schema]
mod tests {
    use pgrx::prelude::*;
    use super::*;

    #[cfg(feature = "pg_test")]
    use pgrx_tests::pg_test;

    fn create_pair(table: &str, columns: &str) {
        Spi::run(&format!("CREATE TABLE {table} ({columns})")).unwrap();
        Spi::run(&format!(
            "CREATE TABLE {table}_draft ({columns}, publish_status BOOLEAN NOT NULL DEFAULT true)"
        ))
        .unwrap();
    }

    #[pg_test]
    fn test_entity_upsert_and_load() {
        create_pair("cat_orders", "id INTEGER PRIMARY KEY, note TEXT");

        let meta = EntityMeta {
            entity: "cat_orders".to_string(),
            table_name: "cat_orders".to_string(),
            publishable: true,
        };
        meta.upsert().unwrap();
        EntityMeta { publishable: false, ..meta.clone() }.upsert().unwrap();

        let loaded = EntityMeta::load_all().unwrap();
        let row = loaded.iter().find(|e| e.entity == "cat_orders").unwrap();
        assert!(!row.publishable);
        assert_eq!(loaded.iter().filter(|e| e.entity == "cat_orders").count(), 1);
    }

    #[pg_test]
    fn test_relation_round_trip_and_cascade() {
        create_pair("cat_pages", "id INTEGER PRIMARY KEY");
        create_pair("cat_sections", "id INTEGER PRIMARY KEY, page_id INTEGER");

        for name in ["cat_pages", "cat_sections"] {
            EntityMeta {
                entity: name.to_string(),
                table_name: name.to_string(),
                publishable: true,
            }
            .upsert()
            .unwrap();
        }

        RelationMeta {
            entity: "cat_pages".to_string(),
            name: "sections".to_string(),
            kind: "has_many".to_string(),
            target: "cat_sections".to_string(),
            foreign_key: vec!["page_id".to_string()],
            join_table: None,
            join_source_key: vec![],
            join_target_key: vec![],
        }
        .upsert()
        .unwrap();

        let relations = RelationMeta::load_all().unwrap();
        let rel = relations.iter().find(|r| r.entity == "cat_pages").unwrap();
        assert_eq!(rel.foreign_key, vec!["page_id".to_string()]);
        assert_eq!(rel.join_table, None);

        let registry = load_registry().unwrap();
        assert_eq!(registry.lookup("cat_pages").unwrap().relationships.len(), 1);

        assert_eq!(EntityMeta::delete("cat_sections"), Ok(true));
        assert_eq!(EntityMeta::delete("cat_sections"), Ok(false));
        assert!(RelationMeta::load_all()
            .unwrap()
            .iter()
            .all(|r| r.entity != "cat_pages"));
    }

    #[pg_test]
    fn test_relation_with_unknown_kind_is_rejected() {
        let result = RelationMeta {
            entity: "cat_a".to_string(),
            name: "b".to_string(),
            kind: "polymorphic".to_string(),
            target: "cat_b".to_string(),
            foreign_key: vec!["a_id".to_string()],
            join_table: None,
            join_source_key: vec![],
            join_target_key: vec![],
        }
        .upsert();
        assert_eq!(result.unwrap_err().sqlstate(), "0A000");
    }
}
