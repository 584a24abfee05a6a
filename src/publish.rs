//! Publisher and Discarder
//!
//! Turns a resolved [`DependencySet`] into an ordered list of statements and
//! runs them one by one through a [`StatementExecutor`]:
//!
//! | direction | delete from | insert into        | then                         |
//! |-----------|-------------|--------------------|------------------------------|
//! | publish   | production  | production ← draft | mark draft rows PUBLISHED    |
//! | discard   | draft       | draft ← production | (rows are inserted PUBLISHED)|
//!
//! Deletes run children first, inserts parents first (see
//! [`crate::dependency::apply_order`]). Every non-empty plan is wrapped in
//! `SET CONSTRAINTS ALL DEFERRED` ... `SET CONSTRAINTS ALL IMMEDIATE`, so
//! deferrable foreign keys from rows outside the closure are checked once
//! the closure is back in place, still inside the call.
//!
//! The first failing statement stops the run; the caller's transaction is
//! expected to roll back everything executed before it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{MAX_KEYS_PER_STATEMENT, PUBLISH_STATUS_COLUMN};
use crate::deadline::Deadline;
use crate::dependency::{apply_order, DependencySet};
use crate::error::{PublishError, PublishResult};
use crate::query::{batches, column_list, require_membership, CompositeStrategy, KeyTuple, Statement};
use crate::schema::{EntitySchema, PublishStatus, SchemaRegistry};
use crate::validation::{quote_ident, quote_qualified};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// draft -> production
    Publish,
    /// production -> draft
    Discard,
}

impl Direction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Direction::Publish => "publish",
            Direction::Discard => "discard",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    DeferConstraints,
    Delete,
    Insert,
    MarkPublished,
    CheckConstraints,
}

impl StepKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            StepKind::DeferConstraints => "defer constraints",
            StepKind::Delete => "delete",
            StepKind::Insert => "insert",
            StepKind::MarkPublished => "mark published",
            StepKind::CheckConstraints => "check constraints",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyStep {
    /// Entity name; `None` for plan-wide steps
    pub entity: Option<String>,
    pub kind: StepKind,
    pub statement: Statement,
}

#[derive(Debug, Clone)]
pub struct ApplyPlan {
    pub direction: Direction,
    pub steps: Vec<ApplyStep>,
    /// The applied entities reference each other in a cycle
    pub cyclic: bool,
    /// Keys per entity name
    pub key_counts: BTreeMap<String, usize>,
}

/// Runs a single statement, returning the number of rows it touched
pub trait StatementExecutor {
    fn execute(&mut self, statement: &Statement) -> PublishResult<u64>;
}

impl ApplyPlan {
    /// Build the statements that move `dependencies` in `direction`.
    ///
    /// Entities without keys contribute nothing.
    pub fn build(
        registry: &SchemaRegistry,
        dependencies: &DependencySet,
        direction: Direction,
        strategy: CompositeStrategy,
    ) -> PublishResult<Self> {
        let order = apply_order(registry, &dependencies.entities());
        let keys_of = |id| dependencies.get(id).map(|d| d.keys()).unwrap_or(&[]);

        let mut steps = Vec::new();
        for id in order.children_first() {
            let schema = registry.entity(id);
            for batch in batches(keys_of(id), MAX_KEYS_PER_STATEMENT) {
                steps.push(step(schema, StepKind::Delete, delete(schema, direction, batch, strategy)?));
            }
        }

        for &id in &order.parents_first {
            let schema = registry.entity(id);
            for batch in batches(keys_of(id), MAX_KEYS_PER_STATEMENT) {
                steps.push(step(schema, StepKind::Insert, insert(schema, direction, batch, strategy)?));
            }
        }

        if direction == Direction::Publish {
            for &id in &order.parents_first {
                let schema = registry.entity(id);
                for batch in batches(keys_of(id), MAX_KEYS_PER_STATEMENT) {
                    steps.push(step(schema, StepKind::MarkPublished, mark_published(schema, batch, strategy)?));
                }
            }
        }

        if !steps.is_empty() {
            steps.insert(0, constraints(StepKind::DeferConstraints, "DEFERRED"));
            steps.push(constraints(StepKind::CheckConstraints, "IMMEDIATE"));
        }

        let key_counts = dependencies
            .iter()
            .map(|(id, dep)| (registry.entity(id).name.clone(), dep.len()))
            .collect();

        Ok(Self {
            direction,
            steps,
            cyclic: order.has_cycle,
            key_counts,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

fn step(schema: &EntitySchema, kind: StepKind, statement: Statement) -> ApplyStep {
    ApplyStep {
        entity: Some(schema.name.clone()),
        kind,
        statement,
    }
}

/// `SET CONSTRAINTS ALL <mode>`, a plan-wide step
fn constraints(kind: StepKind, mode: &str) -> ApplyStep {
    ApplyStep {
        entity: None,
        kind,
        statement: Statement::new(format!("SET CONSTRAINTS ALL {mode}"), Vec::new()),
    }
}

/// `DELETE FROM <production|draft> AS x WHERE <key in batch>`
fn delete(
    schema: &EntitySchema,
    direction: Direction,
    keys: &[KeyTuple],
    strategy: CompositeStrategy,
) -> PublishResult<Statement> {
    let (table, alias) = match direction {
        Direction::Publish => (&schema.table, "p"),
        Direction::Discard => (&schema.draft_table, "d"),
    };
    let pred = require_membership(
        "DELETE",
        Some(alias),
        &schema.key_names(),
        &schema.key_columns,
        keys,
        1,
        strategy,
    )?;

    Ok(Statement::new(
        format!("DELETE FROM {} AS {alias} WHERE {}", quote_qualified(table), pred.sql),
        pred.params,
    ))
}

/// Copy the scalar columns of matching rows from the other store
fn insert(
    schema: &EntitySchema,
    direction: Direction,
    keys: &[KeyTuple],
    strategy: CompositeStrategy,
) -> PublishResult<Statement> {
    let columns = &schema.scalar_columns;
    let (sql, alias) = match direction {
        Direction::Publish => (
            format!(
                "INSERT INTO {} ({}) SELECT {} FROM {} AS d",
                quote_qualified(&schema.table),
                column_list(None, columns),
                column_list(Some("d"), columns),
                quote_qualified(&schema.draft_table),
            ),
            "d",
        ),
        Direction::Discard => (
            format!(
                "INSERT INTO {} ({}, {}) SELECT {}, {} FROM {} AS p",
                quote_qualified(&schema.draft_table),
                column_list(None, columns),
                quote_ident(PUBLISH_STATUS_COLUMN),
                column_list(Some("p"), columns),
                PublishStatus::Published.as_sql(),
                quote_qualified(&schema.table),
            ),
            "p",
        ),
    };
    let pred = require_membership(
        "INSERT",
        Some(alias),
        &schema.key_names(),
        &schema.key_columns,
        keys,
        1,
        strategy,
    )?;

    Ok(Statement::new(format!("{sql} WHERE {}", pred.sql), pred.params))
}

/// `UPDATE <draft> SET publish_status = false WHERE <key in batch>`
fn mark_published(
    schema: &EntitySchema,
    keys: &[KeyTuple],
    strategy: CompositeStrategy,
) -> PublishResult<Statement> {
    let pred = require_membership(
        "UPDATE",
        Some("d"),
        &schema.key_names(),
        &schema.key_columns,
        keys,
        1,
        strategy,
    )?;

    Ok(Statement::new(
        format!(
            "UPDATE {} AS d SET {} = {} WHERE {}",
            quote_qualified(&schema.draft_table),
            quote_ident(PUBLISH_STATUS_COLUMN),
            PublishStatus::Published.as_sql(),
            pred.sql
        ),
        pred.params,
    ))
}

/// Per-entity outcome of an apply run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EntityReport {
    pub keys: usize,
    pub deleted: u64,
    pub inserted: u64,
    pub marked_published: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    pub operation: Direction,
    pub entities: BTreeMap<String, EntityReport>,
    pub statements: usize,
    pub cyclic: bool,
    pub elapsed_ms: u64,
    pub performed_at: DateTime<Utc>,
}

impl ApplyReport {
    pub fn total_keys(&self) -> usize {
        self.entities.values().map(|e| e.keys).sum()
    }
}

/// Execute `plan` statement by statement, stopping at the first error
pub fn apply<E: StatementExecutor>(
    plan: &ApplyPlan,
    executor: &mut E,
    deadline: &Deadline,
) -> PublishResult<ApplyReport> {
    let mut entities: BTreeMap<String, EntityReport> = plan
        .key_counts
        .iter()
        .map(|(name, keys)| {
            (
                name.clone(),
                EntityReport {
                    keys: *keys,
                    ..EntityReport::default()
                },
            )
        })
        .collect();

    for step in &plan.steps {
        deadline.check("apply")?;

        let label = step.entity.as_deref().unwrap_or("*");
        let rows = executor.execute(&step.statement).map_err(|e| match e {
            PublishError::DeadlineExceeded { .. } => e,
            other => PublishError::ApplyFailed {
                entity: label.to_string(),
                step: format!("{} {}", plan.direction.as_str(), step.kind.as_str()),
                reason: other.to_string(),
            },
        })?;

        if let Some(report) = step.entity.as_ref().and_then(|n| entities.get_mut(n)) {
            match step.kind {
                StepKind::Delete => report.deleted += rows,
                StepKind::Insert => report.inserted += rows,
                StepKind::MarkPublished => report.marked_published += rows,
                StepKind::DeferConstraints | StepKind::CheckConstraints => {}
            }
        }
    }

    Ok(ApplyReport {
        operation: plan.direction,
        entities,
        statements: plan.steps.len(),
        cyclic: plan.cyclic,
        elapsed_ms: deadline.elapsed_ms(),
        performed_at: Utc::now(),
    })
}
