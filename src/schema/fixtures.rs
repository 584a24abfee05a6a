//! In-memory schema used by the unit tests.
//!
//! Entities:
//! - `orders (id)` - customer (belongs_to, `customers.order_id`), line_items
//!   (has_many, `line_items.order_id`), tags (many_to_many via
//!   `order_tags_draft`), warehouse (has_one, `orders.warehouse_id`)
//! - `customers (id)`, `line_items (id)`, `tags (id)`
//! - `warehouses (id)` - not publishable
//! - `pages (id)` - translations (has_many, `page_translations.page_id`)
//! - `page_translations (page_id, locale)` - revisions (has_many,
//!   `translation_revisions.(page_id, locale)`)
//! - `translation_revisions (id)`

use std::collections::HashMap;

use crate::catalog::{EntityMeta, RelationMeta};
use crate::error::{PublishError, PublishResult};
use crate::query::KeyColumn;
use crate::schema::{SchemaIntrospector, SchemaRegistry};

#[derive(Debug, Clone, Default)]
struct TableDef {
    key: Vec<KeyColumn>,
    columns: Vec<String>,
}

/// Table metadata held in a map instead of pg_catalog
#[derive(Debug, Clone, Default)]
pub struct StaticIntrospector {
    tables: HashMap<String, TableDef>,
}

impl StaticIntrospector {
    pub fn shop() -> Self {
        let mut this = Self::default();
        this.add_pair("orders", &[("id", "integer")], &["id", "note", "warehouse_id"]);
        this.add_pair("customers", &[("id", "integer")], &["id", "name", "order_id"]);
        this.add_pair("line_items", &[("id", "integer")], &["id", "order_id", "sku"]);
        this.add_pair("tags", &[("id", "integer")], &["id", "label"]);
        this.add_table("order_tags_draft", &[], &["order_id", "tag_id"]);
        this.add_table("warehouses", &[("id", "integer")], &["id", "city"]);
        this.add_pair("pages", &[("id", "integer")], &["id", "title"]);
        this.add_pair(
            "page_translations",
            &[("page_id", "integer"), ("locale", "text")],
            &["page_id", "locale", "body"],
        );
        this.add_pair(
            "translation_revisions",
            &[("id", "bigint")],
            &["id", "page_id", "locale", "body"],
        );
        this
    }

    fn add_table(&mut self, table: &str, key: &[(&str, &str)], columns: &[&str]) {
        self.tables.insert(
            table.to_string(),
            TableDef {
                key: key.iter().map(|(n, t)| KeyColumn::new(*n, *t)).collect(),
                columns: columns.iter().map(|c| (*c).to_string()).collect(),
            },
        );
    }

    /// Production table plus its draft twin with the status column
    fn add_pair(&mut self, table: &str, key: &[(&str, &str)], columns: &[&str]) {
        self.add_table(table, key, columns);
        let mut draft_columns = columns.to_vec();
        draft_columns.push("publish_status");
        self.add_table(&format!("{table}_draft"), key, &draft_columns);
    }

    pub fn set_columns(&mut self, table: &str, columns: &[&str]) {
        if let Some(def) = self.tables.get_mut(table) {
            def.columns = columns.iter().map(|c| (*c).to_string()).collect();
        }
    }

    pub fn set_key(&mut self, table: &str, key: &[(&str, &str)]) {
        if let Some(def) = self.tables.get_mut(table) {
            def.key = key.iter().map(|(n, t)| KeyColumn::new(*n, *t)).collect();
        }
    }

    pub fn drop_table(&mut self, table: &str) {
        self.tables.remove(table);
    }

    fn def(&self, table: &str) -> PublishResult<&TableDef> {
        self.tables.get(table).ok_or_else(|| PublishError::TableNotFound {
            table: table.to_string(),
        })
    }
}

impl SchemaIntrospector for StaticIntrospector {
    fn table_exists(&self, table: &str) -> PublishResult<bool> {
        Ok(self.tables.contains_key(table))
    }

    fn primary_key_columns(&self, table: &str) -> PublishResult<Vec<KeyColumn>> {
        Ok(self.def(table)?.key.clone())
    }

    fn scalar_columns(&self, table: &str) -> PublishResult<Vec<String>> {
        Ok(self.def(table)?.columns.clone())
    }
}

fn entity(name: &str, publishable: bool) -> EntityMeta {
    EntityMeta {
        entity: name.to_string(),
        table_name: name.to_string(),
        publishable,
    }
}

fn relation(entity: &str, name: &str, kind: &str, target: &str, fk: &[&str]) -> RelationMeta {
    RelationMeta {
        entity: entity.to_string(),
        name: name.to_string(),
        kind: kind.to_string(),
        target: target.to_string(),
        foreign_key: fk.iter().map(|c| (*c).to_string()).collect(),
        join_table: None,
        join_source_key: Vec::new(),
        join_target_key: Vec::new(),
    }
}

pub fn shop_entities() -> Vec<EntityMeta> {
    vec![
        entity("orders", true),
        entity("customers", true),
        entity("line_items", true),
        entity("tags", true),
        entity("warehouses", false),
        entity("pages", true),
        entity("page_translations", true),
        entity("translation_revisions", true),
    ]
}

pub fn shop_relations() -> Vec<RelationMeta> {
    let mut tags = relation("orders", "tags", "many_to_many", "tags", &[]);
    tags.join_table = Some("order_tags_draft".to_string());
    tags.join_source_key = vec!["order_id".to_string()];
    tags.join_target_key = vec!["tag_id".to_string()];

    vec![
        relation("orders", "customer", "belongs_to", "customers", &["order_id"]),
        relation("orders", "line_items", "has_many", "line_items", &["order_id"]),
        tags,
        relation("orders", "warehouse", "has_one", "warehouses", &["warehouse_id"]),
        relation("pages", "translations", "has_many", "page_translations", &["page_id"]),
        relation(
            "page_translations",
            "revisions",
            "has_many",
            "translation_revisions",
            &["page_id", "locale"],
        ),
    ]
}

pub fn shop_registry() -> SchemaRegistry {
    SchemaRegistry::build(&shop_entities(), &shop_relations(), &StaticIntrospector::shop())
        .expect("shop fixture registry builds")
}

/// The shop plus `orders.featured_item` (has_one, `orders.featured_item_id`),
/// which closes an orders <-> line_items cycle
pub fn cyclic_shop_registry() -> SchemaRegistry {
    let mut introspector = StaticIntrospector::shop();
    introspector.set_columns("orders", &["id", "note", "warehouse_id", "featured_item_id"]);
    introspector.set_columns(
        "orders_draft",
        &["id", "note", "warehouse_id", "featured_item_id", "publish_status"],
    );
    let mut relations = shop_relations();
    relations.push(relation(
        "orders",
        "featured_item",
        "has_one",
        "line_items",
        &["featured_item_id"],
    ));

    SchemaRegistry::build(&shop_entities(), &relations, &introspector)
        .expect("cyclic shop fixture registry builds")
}
