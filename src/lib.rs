use pgrx::prelude::*;
use pgrx::JsonB;

mod audit;
pub mod catalog;
mod store;
pub mod config;
pub mod deadline;
pub mod ddl;
pub mod dependency;
pub mod error;
pub mod metadata;
pub mod publish;
pub mod query;
pub mod schema;
pub mod validation;

pub use error::{PublishError, PublishResult};

use catalog::{EntityMeta, RelationMeta};
use deadline::Deadline;
use dependency::{Resolution, Resolver, RootRecord};
use publish::{ApplyPlan, Direction};
use schema::SchemaRegistry;
use store::SpiStore;

pg_module_magic!();

/// Get the version of the pg_publish extension
#[pg_extern]
fn pg_publish_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Name of the draft twin of `table`
#[pg_extern]
fn pg_publish_draft_table(table: &str) -> String {
    schema::draft_table_name(table)
}

/// Register (or re-register) an entity and its production table.
///
/// The whole registry is rebuilt afterwards, so a table without a primary
/// key or a draft twin that drifted from production is rejected here rather
/// than at the next publish.
///
/// Usage: SELECT pg_publish_register_entity('orders', 'shop.orders');
#[pg_extern]
fn pg_publish_register_entity(
    entity: &str,
    table_name: &str,
    publishable: default!(bool, true),
) -> String {
    let meta = EntityMeta {
        entity: entity.to_string(),
        table_name: table_name.to_string(),
        publishable,
    };

    if let Err(e) = meta.upsert().and_then(|()| catalog::load_registry()) {
        e.raise();
    }

    info!("pg_publish: registered entity '{}' on {}", entity, table_name);
    format!("entity '{entity}' registered")
}

/// Register (or replace) a relationship between two registered entities
///
/// Usage:
/// SELECT pg_publish_register_relation('orders', 'line_items', 'has_many',
///                                     'line_items', ARRAY['order_id']);
/// SELECT pg_publish_register_relation('orders', 'tags', 'many_to_many', 'tags',
///                                     NULL, 'order_tags',
///                                     ARRAY['order_id'], ARRAY['tag_id']);
#[pg_extern]
#[allow(clippy::too_many_arguments)]
fn pg_publish_register_relation(
    entity: &str,
    name: &str,
    kind: &str,
    target: &str,
    foreign_key: Option<Vec<String>>,
    join_table: default!(Option<&str>, "NULL"),
    join_source_key: default!(Option<Vec<String>>, "NULL"),
    join_target_key: default!(Option<Vec<String>>, "NULL"),
) -> String {
    let meta = RelationMeta {
        entity: entity.to_string(),
        name: name.to_string(),
        kind: kind.to_string(),
        target: target.to_string(),
        foreign_key: foreign_key.unwrap_or_default(),
        join_table: join_table.map(str::to_string),
        join_source_key: join_source_key.unwrap_or_default(),
        join_target_key: join_target_key.unwrap_or_default(),
    };

    if let Err(e) = meta.upsert().and_then(|()| catalog::load_registry()) {
        e.raise();
    }

    info!("pg_publish: registered {} relation {}.{} -> {}", kind, entity, name, target);
    format!("relation '{entity}.{name}' registered")
}

/// Remove an entity; relationships from or to it go with it
#[pg_extern]
fn pg_publish_unregister_entity(entity: &str) -> bool {
    match EntityMeta::delete(entity) {
        Ok(found) => found,
        Err(e) => e.raise(),
    }
}

/// Dependency closure of `roots` as `{"entity": [[key, ...], ...]}`
///
/// Usage: SELECT pg_publish_resolve('[{"entity": "orders", "key": 5}]');
#[pg_extern]
fn pg_publish_resolve(roots: JsonB, timeout_ms: default!(i64, 0)) -> JsonB {
    let deadline = Deadline::from_millis(timeout_ms);
    match load_and_resolve(&roots.0, &mut SpiStore::default(), &deadline) {
        Ok((registry, resolution)) => JsonB(resolution.dependencies.to_json(&registry)),
        Err(e) => e.raise(),
    }
}

/// Copy the closure of `roots` from draft to production and mark it published
///
/// Usage: SELECT pg_publish_publish('[{"entity": "orders", "key": 5}]');
#[pg_extern]
fn pg_publish_publish(roots: JsonB, timeout_ms: default!(i64, 0)) -> JsonB {
    match run(Direction::Publish, &roots.0, timeout_ms) {
        Ok(report) => report,
        Err(e) => e.raise(),
    }
}

/// Overwrite the closure of `roots` in draft with the production rows
///
/// Usage: SELECT pg_publish_discard('[{"entity": "orders", "key": 5}]');
#[pg_extern]
fn pg_publish_discard(roots: JsonB, timeout_ms: default!(i64, 0)) -> JsonB {
    match run(Direction::Discard, &roots.0, timeout_ms) {
        Ok(report) => report,
        Err(e) => e.raise(),
    }
}

fn load_and_resolve(
    roots: &serde_json::Value,
    store: &mut SpiStore,
    deadline: &Deadline,
) -> PublishResult<(SchemaRegistry, Resolution)> {
    let registry = catalog::load_registry()?;
    let roots = RootRecord::parse_all(roots)?;

    let resolution = Resolver::new(&registry, store, *deadline).generate_dependencies(&roots)?;

    for entity in &resolution.skipped_roots {
        notice!("pg_publish: skipping root of non-publishable entity '{}'", entity);
    }
    if config::DEBUG_RESOLVER {
        info!(
            "pg_publish: closure of {} root(s) holds {} key(s) after {} discovery queries ({} root(s) already published)",
            roots.len(),
            resolution.dependencies.total_keys(),
            resolution.queries,
            resolution.clean_roots
        );
    }

    Ok((registry, resolution))
}

/// Resolve, plan and apply in the caller's transaction
fn run(direction: Direction, roots: &serde_json::Value, timeout_ms: i64) -> PublishResult<JsonB> {
    let deadline = Deadline::from_millis(timeout_ms);
    let mut store = SpiStore::default();

    let (registry, resolution) = load_and_resolve(roots, &mut store, &deadline)?;
    let plan = ApplyPlan::build(&registry, &resolution.dependencies, direction, store.strategy())?;

    if plan.cyclic {
        notice!("pg_publish: entities being applied reference each other cyclically");
    }

    let report = publish::apply(&plan, &mut store, &deadline)?;

    if config::AUDIT_ENABLED && !plan.is_empty() {
        audit::log_apply(&report)?;
    }

    info!(
        "pg_publish: {} of {} key(s) across {} entities finished in {}ms",
        direction.as_str(),
        report.total_keys(),
        report.entities.len(),
        report.elapsed_ms
    );

    Ok(JsonB(serde_json::to_value(&report)?))
}

#[cfg(test)]
pub mod pg_test {
    pub fn setup(_options: Vec<&str>) {}

    pub fn postgresql_conf_options() -> Vec<&'static str> {
        vec![]
    }
}

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod tests {
    use pgrx::prelude::*;
    use pgrx::JsonB;

    fn json(sql: &str) -> serde_json::Value {
        Spi::get_one::<JsonB>(sql)
            .expect("query failed")
            .expect("query returned NULL")
            .0
    }

    fn count(sql: &str) -> i64 {
        Spi::get_one::<i64>(sql).expect("query failed").unwrap_or(0)
    }

    /// orders(5) <- customers(42), line_items(101, 102), plus an unrelated dirty item 103
    fn setup_shop(with_foreign_keys: bool) {
        let references = if with_foreign_keys {
            " REFERENCES e2e_orders (id) DEFERRABLE"
        } else {
            ""
        };

        Spi::run("CREATE TABLE e2e_orders (id INTEGER PRIMARY KEY, note TEXT)").unwrap();
        Spi::run(&format!(
            "CREATE TABLE e2e_customers (id INTEGER PRIMARY KEY, name TEXT, order_id INTEGER{references})"
        ))
        .unwrap();
        Spi::run(&format!(
            "CREATE TABLE e2e_line_items (id INTEGER PRIMARY KEY, order_id INTEGER{references}, sku TEXT)"
        ))
        .unwrap();

        Spi::run(
            "SELECT pg_publish_create_draft_table('e2e_orders');
             SELECT pg_publish_create_draft_table('e2e_customers');
             SELECT pg_publish_create_draft_table('e2e_line_items');

             SELECT pg_publish_register_entity('orders', 'e2e_orders');
             SELECT pg_publish_register_entity('customers', 'e2e_customers');
             SELECT pg_publish_register_entity('line_items', 'e2e_line_items');

             SELECT pg_publish_register_relation('orders', 'customer', 'belongs_to', 'customers', ARRAY['order_id']);
             SELECT pg_publish_register_relation('orders', 'line_items', 'has_many', 'line_items', ARRAY['order_id']);",
        )
        .unwrap();

        Spi::run(
            "INSERT INTO e2e_orders_draft (id, note) VALUES (5, 'first order');
             INSERT INTO e2e_customers_draft (id, name, order_id) VALUES (42, 'Ada', 5);
             INSERT INTO e2e_line_items_draft (id, order_id, sku)
             VALUES (101, 5, 'A-1'), (102, 5, 'B-2'), (103, 6, 'C-3');",
        )
        .unwrap();
    }

    #[pg_test]
    fn test_version_callable_from_sql() {
        let version = Spi::get_one::<String>("SELECT pg_publish_version()");
        assert_eq!(version, Ok(Some(env!("CARGO_PKG_VERSION").to_string())));
    }

    #[pg_test]
    fn test_draft_table_name() {
        let name = Spi::get_one::<String>("SELECT pg_publish_draft_table('shop.orders')");
        assert_eq!(name, Ok(Some("shop.orders_draft".to_string())));
    }

    #[pg_test]
    fn test_resolve_order_scenario() {
        setup_shop(true);

        let closure = json(r#"SELECT pg_publish_resolve('[{"entity": "orders", "key": 5}]')"#);
        assert_eq!(
            closure,
            serde_json::json!({
                "customers": [["42"]],
                "line_items": [["101"], ["102"]],
                "orders": [["5"]],
            })
        );
    }

    #[pg_test]
    fn test_publish_order_scenario() {
        setup_shop(true);

        let report = json(r#"SELECT pg_publish_publish('[{"entity": "orders", "key": 5}]')"#);
        assert_eq!(report["operation"], "publish");
        assert_eq!(report["entities"]["line_items"]["inserted"], 2);
        assert_eq!(report["entities"]["customers"]["marked_published"], 1);

        assert_eq!(count("SELECT count(*) FROM e2e_orders WHERE note = 'first order'"), 1);
        assert_eq!(count("SELECT count(*) FROM e2e_customers WHERE order_id = 5"), 1);
        assert_eq!(count("SELECT count(*) FROM e2e_line_items"), 2);

        // only the unrelated item is still dirty
        assert_eq!(
            count(
                "SELECT (SELECT count(*) FROM e2e_orders_draft WHERE publish_status)
                      + (SELECT count(*) FROM e2e_customers_draft WHERE publish_status)
                      + (SELECT count(*) FROM e2e_line_items_draft WHERE publish_status)"
            ),
            1
        );
        assert_eq!(
            count("SELECT count(*) FROM e2e_line_items_draft WHERE publish_status AND id = 103"),
            1
        );

        assert_eq!(
            count("SELECT count(*) FROM pg_publish_log WHERE operation = 'publish'"),
            1
        );
    }

    fn production_snapshot() -> serde_json::Value {
        json(
            "SELECT jsonb_build_array(
                 (SELECT jsonb_agg(o ORDER BY id) FROM e2e_orders o),
                 (SELECT jsonb_agg(c ORDER BY id) FROM e2e_customers c),
                 (SELECT jsonb_agg(l ORDER BY id) FROM e2e_line_items l))",
        )
    }

    #[pg_test]
    fn test_republish_changes_nothing() {
        setup_shop(true);

        Spi::run(r#"SELECT pg_publish_publish('[{"entity": "orders", "key": 5}]')"#).unwrap();
        let before = production_snapshot();

        let report = json(r#"SELECT pg_publish_publish('[{"entity": "orders", "key": 5}]')"#);

        assert_eq!(before, production_snapshot());
        assert_eq!(report["entities"], serde_json::json!({}));
        assert_eq!(report["statements"], 0);
        assert_eq!(
            count("SELECT count(*) FROM pg_publish_log WHERE operation = 'publish'"),
            1
        );
    }

    #[pg_test]
    fn test_republish_edited_parent_keeps_children() {
        setup_shop(true);
        Spi::run(r#"SELECT pg_publish_publish('[{"entity": "orders", "key": 5}]')"#).unwrap();

        Spi::run("UPDATE e2e_orders_draft SET note = 'second', publish_status = true WHERE id = 5")
            .unwrap();
        let report = json(r#"SELECT pg_publish_publish('[{"entity": "orders", "key": 5}]')"#);

        assert_eq!(report["entities"].as_object().map(|e| e.len()), Some(1));
        assert_eq!(report["entities"]["orders"]["inserted"], 1);
        assert_eq!(
            Spi::get_one::<String>("SELECT note FROM e2e_orders WHERE id = 5"),
            Ok(Some("second".to_string()))
        );
        assert_eq!(count("SELECT count(*) FROM e2e_customers WHERE order_id = 5"), 1);
        assert_eq!(count("SELECT count(*) FROM e2e_line_items WHERE order_id = 5"), 2);
    }

    #[pg_test]
    fn test_clean_root_brings_only_dirty_children() {
        setup_shop(true);
        Spi::run(r#"SELECT pg_publish_publish('[{"entity": "orders", "key": 5}]')"#).unwrap();
        Spi::run("UPDATE e2e_line_items_draft SET sku = 'B-3', publish_status = true WHERE id = 102")
            .unwrap();

        let closure = json(r#"SELECT pg_publish_resolve('[{"entity": "orders", "key": 5}]')"#);
        assert_eq!(closure, serde_json::json!({ "line_items": [["102"]] }));

        Spi::run(r#"SELECT pg_publish_publish('[{"entity": "orders", "key": 5}]')"#).unwrap();
        assert_eq!(
            Spi::get_one::<String>("SELECT sku FROM e2e_line_items WHERE id = 102"),
            Ok(Some("B-3".to_string()))
        );
    }

    #[pg_test]
    fn test_root_key_text_is_canonical() {
        setup_shop(true);

        let closure = json(
            r#"SELECT pg_publish_resolve('[{"entity": "orders", "key": "05"}, {"entity": "orders", "key": 5.0}]')"#,
        );
        assert_eq!(closure["orders"], serde_json::json!([["5"]]));
        assert_eq!(closure["line_items"], serde_json::json!([["101"], ["102"]]));

        Spi::run(r#"SELECT pg_publish_publish('[{"entity": "orders", "key": "05"}]')"#).unwrap();
        assert_eq!(count("SELECT count(*) FROM e2e_orders WHERE id = 5"), 1);
        assert_eq!(
            count("SELECT count(*) FROM e2e_orders_draft WHERE publish_status"),
            0
        );
    }

    #[pg_test]
    fn test_composite_key_round_trip() {
        Spi::run(
            "CREATE TABLE e2e_pages (id INTEGER PRIMARY KEY, title TEXT);
             CREATE TABLE e2e_translations (
                 page_id INTEGER, locale TEXT, body TEXT, PRIMARY KEY (page_id, locale));
             SELECT pg_publish_create_draft_table('e2e_pages');
             SELECT pg_publish_create_draft_table('e2e_translations');
             SELECT pg_publish_register_entity('pages', 'e2e_pages');
             SELECT pg_publish_register_entity('translations', 'e2e_translations');
             SELECT pg_publish_register_relation('pages', 'translations', 'has_many', 'translations', ARRAY['page_id']);

             INSERT INTO e2e_translations_draft (page_id, locale, body)
             VALUES (1, 'en', 'Hello'), (1, 'fr', 'Bonjour');",
        )
        .unwrap();

        let closure = json(
            r#"SELECT pg_publish_resolve('[{"entity": "translations", "key": {"page_id": 1, "locale": "fr"}}]')"#,
        );
        assert_eq!(closure, serde_json::json!({ "translations": [["1", "fr"]] }));

        Spi::run(
            r#"SELECT pg_publish_publish('[{"entity": "translations", "key": [1, "fr"]}]')"#,
        )
        .unwrap();

        assert_eq!(
            Spi::get_one::<String>("SELECT body FROM e2e_translations WHERE page_id = 1 AND locale = 'fr'"),
            Ok(Some("Bonjour".to_string()))
        );
        assert_eq!(count("SELECT count(*) FROM e2e_translations"), 1);
        assert_eq!(
            count("SELECT count(*) FROM e2e_translations_draft WHERE publish_status"),
            1
        );
    }

    #[pg_test]
    fn test_failed_publish_leaves_everything_untouched() {
        setup_shop(false);
        // added after the draft was created, so only production enforces it
        Spi::run("ALTER TABLE e2e_line_items ADD CONSTRAINT sku_is_short CHECK (length(sku) < 3)")
            .unwrap();

        Spi::run(
            r#"DO $$
               BEGIN
                   PERFORM pg_publish_publish('[{"entity": "orders", "key": 5}]');
                   RAISE EXCEPTION 'publish should have failed';
               EXCEPTION WHEN check_violation THEN
                   NULL;
               END $$"#,
        )
        .unwrap();

        assert_eq!(count("SELECT count(*) FROM e2e_orders"), 0);
        assert_eq!(count("SELECT count(*) FROM e2e_customers"), 0);
        assert_eq!(
            count("SELECT count(*) FROM e2e_orders_draft WHERE publish_status"),
            1
        );
        assert_eq!(count("SELECT count(*) FROM pg_publish_log"), 0);
    }

    #[pg_test]
    fn test_discard_restores_draft() {
        setup_shop(true);
        Spi::run(r#"SELECT pg_publish_publish('[{"entity": "orders", "key": 5}]')"#).unwrap();

        Spi::run(
            "UPDATE e2e_orders_draft SET note = 'edited', publish_status = true WHERE id = 5;
             UPDATE e2e_line_items_draft SET sku = 'Z-9', publish_status = true WHERE id = 101;",
        )
        .unwrap();

        let report = json(r#"SELECT pg_publish_discard('[{"entity": "orders", "key": 5}]')"#);
        assert_eq!(report["operation"], "discard");

        assert_eq!(
            Spi::get_one::<String>("SELECT note FROM e2e_orders_draft WHERE id = 5"),
            Ok(Some("first order".to_string()))
        );
        assert_eq!(
            Spi::get_one::<String>("SELECT sku FROM e2e_line_items_draft WHERE id = 101"),
            Ok(Some("A-1".to_string()))
        );
        assert_eq!(
            count("SELECT count(*) FROM e2e_orders_draft WHERE publish_status"),
            0
        );
        // production is never written by a discard
        assert_eq!(count("SELECT count(*) FROM e2e_orders WHERE note = 'edited'"), 0);
    }

    #[pg_test]
    fn test_mixed_case_table_round_trip() {
        Spi::run(
            r#"CREATE TABLE "E2eOrders" ("Id" INTEGER PRIMARY KEY, "Note" TEXT);
               SELECT pg_publish_create_draft_table('E2eOrders');
               SELECT pg_publish_register_entity('mixed', 'E2eOrders');
               INSERT INTO "E2eOrders_draft" ("Id", "Note") VALUES (1, 'kept case');"#,
        )
        .unwrap();

        Spi::run(r#"SELECT pg_publish_publish('[{"entity": "mixed", "key": 1}]')"#).unwrap();

        assert_eq!(
            Spi::get_one::<String>(r#"SELECT "Note" FROM "E2eOrders" WHERE "Id" = 1"#),
            Ok(Some("kept case".to_string()))
        );
    }

    #[pg_test]
    fn test_unregister_entity() {
        setup_shop(false);

        assert_eq!(
            Spi::get_one::<bool>("SELECT pg_publish_unregister_entity('line_items')"),
            Ok(Some(true))
        );
        assert_eq!(
            count("SELECT count(*) FROM pg_publish_relation WHERE target = 'line_items'"),
            0
        );
        assert_eq!(
            Spi::get_one::<bool>("SELECT pg_publish_unregister_entity('line_items')"),
            Ok(Some(false))
        );
    }

    #[pg_test]
    #[should_panic(expected = "publish metadata not found for entity 'invoices'")]
    fn test_unknown_root_entity_raises() {
        setup_shop(false);
        Spi::run(r#"SELECT pg_publish_publish('[{"entity": "invoices", "key": 1}]')"#).unwrap();
    }

    #[pg_test]
    #[should_panic(expected = "has no primary key")]
    fn test_register_rejects_table_without_key() {
        Spi::run("CREATE TABLE e2e_keyless (id INTEGER, note TEXT)").unwrap();
        Spi::run("SELECT pg_publish_register_entity('keyless', 'e2e_keyless', false)").unwrap();
    }
}
