use std::collections::{BTreeMap, BTreeSet};

use crate::schema::{EntityId, RelationKind, SchemaRegistry};

/// Apply order for a set of entities
///
/// Example (orders -> customers/line_items via foreign keys on the children):
///
/// - `orders` (parent)
/// - `customers`, `line_items` (carry `order_id`)
///
/// Parents-first order: `["orders", "customers", "line_items"]`; deletes walk
/// it backwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOrder {
    /// Parents before children; cycle members trail in registry order
    pub parents_first: Vec<EntityId>,
    /// The relationships among the entities form a cycle
    pub has_cycle: bool,
}

impl ApplyOrder {
    pub fn children_first(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.parents_first.iter().rev().copied()
    }
}

/// Order `entities` so that every referenced row is written before the row
/// holding the foreign key.
///
/// - `belongs_to` / `has_many`: the target holds the foreign key, so the
///   source is the parent
/// - `has_one`: the source holds the foreign key, so the target is the parent
/// - `many_to_many`: the link lives in a join table, no edge
pub fn apply_order(registry: &SchemaRegistry, entities: &[EntityId]) -> ApplyOrder {
    let members: BTreeSet<EntityId> = entities.iter().copied().collect();

    // parent -> children, child -> number of unresolved parents
    let mut children: BTreeMap<EntityId, BTreeSet<EntityId>> = BTreeMap::new();
    let mut in_degree: BTreeMap<EntityId, usize> = members.iter().map(|id| (*id, 0)).collect();
    let mut has_cycle = false;

    for &source in &members {
        for relation in &registry.entity(source).relationships {
            if !members.contains(&relation.target) {
                continue;
            }
            let (parent, child) = match relation.kind {
                RelationKind::BelongsTo | RelationKind::HasMany => (source, relation.target),
                RelationKind::HasOne => (relation.target, source),
                RelationKind::ManyToMany => continue,
            };
            if parent == child {
                has_cycle = true;
                continue;
            }
            if children.entry(parent).or_default().insert(child) {
                *in_degree.entry(child).or_insert(0) += 1;
            }
        }
    }

    // Kahn's algorithm; the ready set is ordered so ties resolve by registry order
    let mut ready: BTreeSet<EntityId> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut parents_first = Vec::with_capacity(members.len());

    while let Some(entity) = ready.pop_first() {
        parents_first.push(entity);

        if let Some(kids) = children.get(&entity) {
            for kid in kids {
                if let Some(degree) = in_degree.get_mut(kid) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(*kid);
                    }
                }
            }
        }
    }

    if parents_first.len() != members.len() {
        has_cycle = true;
        let placed: BTreeSet<EntityId> = parents_first.iter().copied().collect();
        parents_first.extend(members.iter().filter(|id| !placed.contains(id)));
    }

    ApplyOrder {
        parents_first,
        has_cycle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::RelationMeta;
    use crate::schema::fixtures::{shop_entities, shop_relations, shop_registry, StaticIntrospector};

    fn ids(registry: &SchemaRegistry, names: &[&str]) -> Vec<EntityId> {
        names.iter().map(|n| registry.id_of(n).unwrap()).collect()
    }

    fn names(registry: &SchemaRegistry, order: &[EntityId]) -> Vec<String> {
        order.iter().map(|id| registry.entity(*id).name.clone()).collect()
    }

    #[test]
    fn test_parents_before_children() {
        let registry = shop_registry();
        let order = apply_order(
            &registry,
            &ids(&registry, &["line_items", "customers", "orders"]),
        );

        assert!(!order.has_cycle);
        assert_eq!(
            names(&registry, &order.parents_first),
            vec!["orders", "customers", "line_items"]
        );
        assert_eq!(
            names(&registry, &order.children_first().collect::<Vec<_>>()),
            vec!["line_items", "customers", "orders"]
        );
    }

    #[test]
    fn test_chain_across_composite_keys() {
        let registry = shop_registry();
        let order = apply_order(
            &registry,
            &ids(&registry, &["translation_revisions", "pages", "page_translations"]),
        );

        assert_eq!(
            names(&registry, &order.parents_first),
            vec!["pages", "page_translations", "translation_revisions"]
        );
    }

    #[test]
    fn test_many_to_many_adds_no_edge() {
        let registry = shop_registry();
        let order = apply_order(&registry, &ids(&registry, &["tags", "orders"]));

        assert!(!order.has_cycle);
        // registry (name) order: orders < tags
        assert_eq!(names(&registry, &order.parents_first), vec!["orders", "tags"]);
    }

    fn has_one(entity: &str, name: &str, target: &str, fk: &str) -> RelationMeta {
        RelationMeta {
            entity: entity.to_string(),
            name: name.to_string(),
            kind: "has_one".to_string(),
            target: target.to_string(),
            foreign_key: vec![fk.to_string()],
            join_table: None,
            join_source_key: vec![],
            join_target_key: vec![],
        }
    }

    #[test]
    fn test_has_one_points_at_the_parent() {
        // customers holds order_id, so orders must be written first even
        // though customers sorts earlier
        let relations = vec![has_one("customers", "order", "orders", "order_id")];
        let registry =
            SchemaRegistry::build(&shop_entities(), &relations, &StaticIntrospector::shop())
                .unwrap();

        let order = apply_order(&registry, &ids(&registry, &["customers", "orders"]));
        assert!(!order.has_cycle);
        assert_eq!(names(&registry, &order.parents_first), vec!["orders", "customers"]);
    }

    #[test]
    fn test_cycle_is_reported() {
        let mut introspector = StaticIntrospector::shop();
        introspector.set_columns("orders", &["id", "note", "warehouse_id", "featured_item_id"]);
        introspector.set_columns(
            "orders_draft",
            &["id", "note", "warehouse_id", "featured_item_id", "publish_status"],
        );
        let mut relations = shop_relations();
        relations.push(has_one("orders", "featured_item", "line_items", "featured_item_id"));
        let registry = SchemaRegistry::build(&shop_entities(), &relations, &introspector).unwrap();

        let order = apply_order(
            &registry,
            &ids(&registry, &["orders", "customers", "line_items"]),
        );

        assert!(order.has_cycle);
        assert_eq!(
            names(&registry, &order.parents_first),
            vec!["customers", "line_items", "orders"]
        );
    }

    #[test]
    fn test_entities_outside_the_set_are_ignored() {
        let registry = shop_registry();
        let order = apply_order(&registry, &ids(&registry, &["line_items"]));

        assert!(!order.has_cycle);
        assert_eq!(names(&registry, &order.parents_first), vec!["line_items"]);
    }
}
