use crate::query::CompositeStrategy;

/// Suffix appended to a production table name to get its draft twin
/// (`orders` -> `orders_draft`)
pub const DRAFT_TABLE_SUFFIX: &str = "_draft";

/// Draft-only status column; `true` = DIRTY, `false` = PUBLISHED
pub const PUBLISH_STATUS_COLUMN: &str = "publish_status";

/// Upper bound on the number of key tuples a single closure may hold.
/// Guards against runaway expansion over a densely linked draft graph.
pub const MAX_CLOSURE_KEYS: usize = 100_000;

/// Lock discovered draft rows (`FOR UPDATE`) so their status cannot change
/// between resolve and apply
pub const LOCK_DRAFT_ROWS: bool = true;

/// Default deadline for resolve + apply when the caller passes 0 (0 = none)
pub const DEFAULT_TIMEOUT_MS: u64 = 0;

/// How composite-key membership is rendered
pub const COMPOSITE_KEY_STRATEGY: CompositeStrategy = CompositeStrategy::RowValues;

/// Append every publish/discard to pg_publish_log
pub const AUDIT_ENABLED: bool = true;

/// Enable verbose resolver logging (for debugging)
pub const DEBUG_RESOLVER: bool = false;

/// Keys bound into a single statement; larger sets are split into batches
pub const MAX_KEYS_PER_STATEMENT: usize = 5_000;
