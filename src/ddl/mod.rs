//! DDL Operations: draft table management
//!
//! Every publishable entity needs a draft twin of its production table:
//! - **create**: `<table>_draft` with the same columns, defaults, CHECK
//!   constraints and indexes, plus `publish_status boolean NOT NULL DEFAULT true`
//! - **drop**: removes the draft twin again

pub mod create;
pub mod drop;

pub use create::create_draft_table;
pub use drop::drop_draft_table;

use pgrx::prelude::*;

/// SQL function: Create the draft twin of a table
///
/// Usage: SELECT pg_publish_create_draft_table('orders');
#[pg_extern]
fn pg_publish_create_draft_table(table: &str) -> Result<String, String> {
    match create_draft_table(table) {
        Ok(draft) => Ok(format!("draft table '{draft}' created")),
        Err(e) => Err(format!("Failed to create draft table: {e}")),
    }
}

/// SQL function: Drop the draft twin of a table
///
/// Usage: SELECT pg_publish_drop_draft_table('orders', true);  -- true = IF EXISTS
#[pg_extern]
fn pg_publish_drop_draft_table(table: &str, if_exists: default!(bool, false)) -> Result<String, String> {
    match drop_draft_table(table, if_exists) {
        Ok(true) => Ok(format!("draft table for '{table}' dropped")),
        Ok(false) => Ok(format!("draft table for '{table}' does not exist, skipping")),
        Err(e) => Err(format!("Failed to drop draft table: {e}")),
    }
}
