//! Dependency Resolver
//!
//! Computes the closure of draft rows that must move together with a set of
//! root records. Starting from the roots, every relationship of every entity
//! is followed to DIRTY draft rows of publishable targets until no step
//! yields a key that was not already known.
//!
//! ## Algorithm
//!
//! ```text
//! generate_dependencies(roots):
//!     for (entity, keys) in roots grouped by entity:
//!         for row in lookup_roots(entity, keys):
//!             if row is PUBLISHED: queue.push((entity, [row.key]))
//!             else: add_dependency(entity, [row.key])
//!
//! add_dependency(entity, keys):
//!     delta = keys not yet in closure[entity]
//!     closure[entity] += delta
//!     queue.push((entity, delta))
//!
//! while (entity, delta) = queue.pop():
//!     for rel in entity.relationships where rel.target is publishable:
//!         found = discover(entity, rel, delta)
//!         add_dependency(rel.target, found)
//! ```
//!
//! Only the delta is ever expanded, so each (entity, key) pair produces
//! exactly one discovery query per relationship. The queue keeps deep or
//! cyclic graphs off the call stack.
//!
//! Roots are read back from their draft table before anything is expanded.
//! The lookup canonicalises the key text (`"05"` becomes `"5"`) and locks the
//! root rows. A root whose draft row is PUBLISHED is expanded for dirty
//! dependents but is not itself applied, so republishing an unchanged root
//! is a no-op. A root with no draft row at all is applied, which removes it
//! from production on publish.

use std::collections::{BTreeMap, HashSet, VecDeque};

use serde::Deserialize;
use serde_json::{Map, Value};

use super::discovery::{Discovery, RootLookup, RootRow};
use crate::config::{MAX_CLOSURE_KEYS, MAX_KEYS_PER_STATEMENT};
use crate::deadline::Deadline;
use crate::error::{PublishError, PublishResult};
use crate::query::{batches, KeyTuple};
use crate::schema::{EntityId, EntitySchema, PublishStatus, SchemaRegistry};

/// Where discovery queries are answered
pub trait DraftSource {
    /// One row per key in `lookup.keys`, with the key as the database
    /// renders it and the status of its draft row
    fn lookup_roots(&mut self, lookup: &RootLookup<'_>) -> PublishResult<Vec<RootRow>>;

    /// Keys of DIRTY target rows linked to `discovery.keys`
    fn discover(&mut self, discovery: &Discovery<'_>) -> PublishResult<Vec<KeyTuple>>;
}

/// Insertion-ordered, deduplicated key tuples of one entity
#[derive(Debug, Clone, Default)]
pub struct Dependency {
    keys: Vec<KeyTuple>,
    index: HashSet<KeyTuple>,
}

impl Dependency {
    /// Add `keys`, returning those that were not present yet
    fn merge(&mut self, keys: Vec<KeyTuple>) -> Vec<KeyTuple> {
        let mut delta = Vec::new();
        for key in keys {
            if self.index.insert(key.clone()) {
                self.keys.push(key.clone());
                delta.push(key);
            }
        }
        delta
    }

    pub fn keys(&self) -> &[KeyTuple] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Closure of one resolve call: entity -> dependency
#[derive(Debug, Clone, Default)]
pub struct DependencySet {
    entries: BTreeMap<EntityId, Dependency>,
}

impl DependencySet {
    pub fn get(&self, entity: EntityId) -> Option<&Dependency> {
        self.entries.get(&entity)
    }

    /// Entities with at least one key, in registry order
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &Dependency)> {
        self.entries
            .iter()
            .filter(|(_, dep)| !dep.is_empty())
            .map(|(id, dep)| (*id, dep))
    }

    pub fn entities(&self) -> Vec<EntityId> {
        self.iter().map(|(id, _)| id).collect()
    }

    pub fn total_keys(&self) -> usize {
        self.entries.values().map(Dependency::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_keys() == 0
    }

    /// `{"entity": [["k1", ...], ...], ...}`
    pub fn to_json(&self, registry: &SchemaRegistry) -> Value {
        let mut map = Map::new();
        for (id, dep) in self.iter() {
            let keys = dep
                .keys()
                .iter()
                .map(|k| Value::from(k.values().to_vec()))
                .collect::<Vec<_>>();
            map.insert(registry.entity(id).name.clone(), Value::Array(keys));
        }
        Value::Object(map)
    }

    fn entry(&mut self, entity: EntityId) -> &mut Dependency {
        self.entries.entry(entity).or_default()
    }
}

/// A root record as passed to the SQL functions:
/// `{"entity": "orders", "key": 5}`, `{"entity": "page_translations", "key": [7, "en"]}`
/// or `{"entity": "page_translations", "key": {"page_id": 7, "locale": "en"}}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RootRecord {
    pub entity: String,
    pub key: Value,
}

impl RootRecord {
    /// Parse the roots argument (a JSON array of root records)
    pub fn parse_all(roots: &Value) -> PublishResult<Vec<Self>> {
        if !roots.is_array() {
            return Err(PublishError::InvalidInput {
                parameter: "roots".to_string(),
                value: truncate_json(roots),
                reason: "expected an array of {\"entity\", \"key\"} objects".to_string(),
            });
        }
        Ok(serde_json::from_value(roots.clone())?)
    }

    /// The key tuple of this root, in the entity's key-column order
    pub fn key_tuple(&self, schema: &EntitySchema) -> PublishResult<KeyTuple> {
        let names = schema.key_names();
        let invalid = |reason: String| PublishError::InvalidInput {
            parameter: "key".to_string(),
            value: format!("{}: {}", self.entity, truncate_json(&self.key)),
            reason,
        };

        let values: Vec<&Value> = match &self.key {
            Value::Array(items) => items.iter().collect(),
            Value::Object(fields) => {
                if let Some(extra) = fields.keys().find(|f| !names.contains(f)) {
                    return Err(invalid(format!("'{extra}' is not a key column")));
                }
                names
                    .iter()
                    .map(|n| {
                        fields
                            .get(n)
                            .ok_or_else(|| invalid(format!("missing key column '{n}'")))
                    })
                    .collect::<PublishResult<_>>()?
            }
            scalar => vec![scalar],
        };

        if values.len() != names.len() {
            return Err(invalid(format!(
                "expected {} key value(s), got {}",
                names.len(),
                values.len()
            )));
        }

        let text = values
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s.clone()),
                Value::Number(n) => Ok(number_text(n)),
                Value::Bool(b) => Ok(b.to_string()),
                other => Err(invalid(format!("unsupported key value {other}"))),
            })
            .collect::<PublishResult<Vec<_>>>()?;

        Ok(KeyTuple::new(text))
    }
}

/// `5.0` and `5` name the same integer key
fn number_text(n: &serde_json::Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => (f as i64).to_string(),
        _ => n.to_string(),
    }
}

fn truncate_json(value: &Value) -> String {
    let text = value.to_string();
    match text.char_indices().nth(80) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text,
    }
}

/// Result of a resolve call
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub dependencies: DependencySet,
    /// Roots dropped because their entity is not publishable
    pub skipped_roots: Vec<String>,
    /// Roots whose draft row was already PUBLISHED: expanded, not applied
    pub clean_roots: usize,
    /// Discovery queries issued
    pub queries: usize,
}

pub struct Resolver<'a, S: DraftSource> {
    registry: &'a SchemaRegistry,
    source: &'a mut S,
    deadline: Deadline,
    max_keys: usize,
    dependencies: DependencySet,
    pending: VecDeque<(EntityId, Vec<KeyTuple>)>,
    queries: usize,
}

impl<'a, S: DraftSource> Resolver<'a, S> {
    pub fn new(registry: &'a SchemaRegistry, source: &'a mut S, deadline: Deadline) -> Self {
        Self {
            registry,
            source,
            deadline,
            max_keys: MAX_CLOSURE_KEYS,
            dependencies: DependencySet::default(),
            pending: VecDeque::new(),
            queries: 0,
        }
    }

    pub fn with_max_keys(mut self, max_keys: usize) -> Self {
        self.max_keys = max_keys;
        self
    }

    /// Seed the closure with the roots and expand it to a fixpoint
    pub fn generate_dependencies(mut self, roots: &[RootRecord]) -> PublishResult<Resolution> {
        let mut skipped_roots = Vec::new();
        let mut grouped: Vec<(EntityId, Vec<KeyTuple>)> = Vec::new();

        for root in roots {
            let schema = self.registry.lookup(&root.entity)?;
            if !schema.publishable {
                skipped_roots.push(root.entity.clone());
                continue;
            }
            let key = root.key_tuple(schema)?;
            match grouped.iter_mut().find(|(id, _)| *id == schema.id) {
                Some((_, keys)) => keys.push(key),
                None => grouped.push((schema.id, vec![key])),
            }
        }

        let mut clean: HashSet<(EntityId, KeyTuple)> = HashSet::new();
        for (entity, keys) in grouped {
            for batch in batches(&keys, MAX_KEYS_PER_STATEMENT) {
                for row in self.lookup_roots(entity, batch)? {
                    match row.status {
                        Some(PublishStatus::Published) => {
                            // discovery only returns DIRTY rows, so a clean
                            // root can never re-enter the closure
                            if clean.insert((entity, row.key.clone())) {
                                self.pending.push_back((entity, vec![row.key]));
                            }
                        }
                        Some(PublishStatus::Dirty) | None => {
                            self.enqueue(entity, vec![row.key])?;
                        }
                    }
                }
                self.drain()?;
            }
        }

        Ok(Resolution {
            dependencies: self.dependencies,
            skipped_roots,
            clean_roots: clean.len(),
            queries: self.queries,
        })
    }

    /// Merge `keys` into the closure of `entity` and expand whatever is new
    pub fn add_dependency(&mut self, entity: EntityId, keys: Vec<KeyTuple>) -> PublishResult<()> {
        self.enqueue(entity, keys)?;
        self.drain()
    }

    fn drain(&mut self) -> PublishResult<()> {
        while let Some((entity, delta)) = self.pending.pop_front() {
            self.expand(entity, &delta)?;
        }
        Ok(())
    }

    fn lookup_roots(&mut self, entity: EntityId, keys: &[KeyTuple]) -> PublishResult<Vec<RootRow>> {
        self.deadline.check("resolve")?;

        let registry = self.registry;
        let schema = registry.entity(entity);
        let lookup = RootLookup { entity: schema, keys };
        self.source.lookup_roots(&lookup).map_err(|e| match e {
            PublishError::DeadlineExceeded { .. } => e,
            other => PublishError::DiscoveryFailed {
                entity: schema.name.clone(),
                relation: "roots".to_string(),
                reason: other.to_string(),
            },
        })
    }

    fn enqueue(&mut self, entity: EntityId, keys: Vec<KeyTuple>) -> PublishResult<()> {
        let delta = self.dependencies.entry(entity).merge(keys);
        if delta.is_empty() {
            return Ok(());
        }

        let size = self.dependencies.total_keys();
        if size > self.max_keys {
            return Err(PublishError::ClosureTooLarge {
                size,
                max_size: self.max_keys,
            });
        }

        self.pending.push_back((entity, delta));
        Ok(())
    }

    /// Follow every relationship of `entity` from `keys` to publishable targets
    fn expand(&mut self, entity: EntityId, keys: &[KeyTuple]) -> PublishResult<()> {
        let registry = self.registry;
        let source = registry.entity(entity);

        for relation in &source.relationships {
            let target = registry.entity(relation.target);
            if !target.publishable {
                continue;
            }

            for batch in batches(keys, MAX_KEYS_PER_STATEMENT) {
                self.deadline.check("resolve")?;

                let discovery = Discovery {
                    source,
                    relation,
                    target,
                    keys: batch,
                };
                self.queries += 1;
                let found = self.source.discover(&discovery).map_err(|e| match e {
                    PublishError::DeadlineExceeded { .. } => e,
                    other => PublishError::DiscoveryFailed {
                        entity: source.name.clone(),
                        relation: relation.name.clone(),
                        reason: other.to_string(),
                    },
                })?;

                self.enqueue(target.id, found)?;
            }
        }

        Ok(())
    }
}
