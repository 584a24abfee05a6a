//! Input Validation Module
//!
//! Every table, column and entity name reaches SQL through `format!`, so each
//! one is checked here first and then double-quoted by [`quote_ident`] /
//! [`quote_qualified`] when it is rendered.
//!
//! ## Usage
//!
//! ```ignore
//! use crate::validation::{validate_qualified_name, quote_qualified};
//!
//! validate_qualified_name(table_name, "table_name")?;
//! let sql = format!("DELETE FROM {}", quote_qualified(table_name));
//! ```

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{PublishError, PublishResult};

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").expect("identifier pattern compiles")
});

/// PostgreSQL truncates identifiers past NAMEDATALEN - 1 bytes
const MAX_IDENTIFIER_LEN: usize = 63;

/// Validate a single `PostgreSQL` identifier (table, column or entity name)
///
/// Allows letters, digits, underscore and `$`, not starting with a digit.
/// Rejects quotes, semicolons, dots, whitespace and anything longer than 63
/// bytes.
///
/// ```ignore
/// validate_sql_identifier("line_items", "table_name")?;        // ✓
/// validate_sql_identifier("orders; DROP TABLE", "table")?;     // ✗
/// ```
pub fn validate_sql_identifier(identifier: &str, param_name: &str) -> PublishResult<()> {
    if identifier.is_empty() {
        return Err(PublishError::InvalidIdentifier {
            parameter: param_name.to_string(),
            value: identifier.to_string(),
            reason: "Identifier cannot be empty".to_string(),
        });
    }

    if identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(PublishError::InvalidIdentifier {
            parameter: param_name.to_string(),
            value: sanitize_for_logging(identifier),
            reason: format!("Identifier too long (max {MAX_IDENTIFIER_LEN} characters)"),
        });
    }

    if !IDENTIFIER.is_match(identifier) {
        return Err(PublishError::InvalidIdentifier {
            parameter: param_name.to_string(),
            value: sanitize_for_logging(identifier),
            reason: "Identifier must start with a letter or underscore and contain only \
                     alphanumeric characters, underscores or '$'"
                .to_string(),
        });
    }

    Ok(())
}

/// Validate an optionally schema-qualified name (`orders` or `shop.orders`)
pub fn validate_qualified_name(name: &str, param_name: &str) -> PublishResult<()> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 {
        return Err(PublishError::InvalidIdentifier {
            parameter: param_name.to_string(),
            value: sanitize_for_logging(name),
            reason: "Expected <table> or <schema>.<table>".to_string(),
        });
    }

    for part in parts {
        validate_sql_identifier(part, param_name)?;
    }

    Ok(())
}

/// Validate every entry of a column list; the list itself must not be empty
pub fn validate_column_list(columns: &[String], param_name: &str) -> PublishResult<()> {
    if columns.is_empty() {
        return Err(PublishError::InvalidInput {
            parameter: param_name.to_string(),
            value: "{}".to_string(),
            reason: "At least one column is required".to_string(),
        });
    }

    for column in columns {
        validate_sql_identifier(column, param_name)?;
    }

    Ok(())
}

/// Double-quote a validated identifier
pub fn quote_ident(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Double-quote each part of a validated, optionally qualified name
pub fn quote_qualified(name: &str) -> String {
    name.split('.')
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(".")
}

/// Sanitize string for logging (truncate, remove control chars)
fn sanitize_for_logging(s: &str) -> String {
    let max_len = 50;
    let truncated = match s.char_indices().nth(max_len) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    };

    truncated
        .replace('\0', "\\0")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identifiers() {
        assert!(validate_sql_identifier("orders", "test").is_ok());
        assert!(validate_sql_identifier("line_items", "test").is_ok());
        assert!(validate_sql_identifier("_hidden", "test").is_ok());
        assert!(validate_sql_identifier("table123", "test").is_ok());
    }

    #[test]
    fn test_invalid_identifiers() {
        assert!(validate_sql_identifier("", "test").is_err());
        assert!(validate_sql_identifier("table; DROP", "test").is_err());
        assert!(validate_sql_identifier("user-data", "test").is_err());
        assert!(validate_sql_identifier("my table", "test").is_err());
        assert!(validate_sql_identifier("'admin'", "test").is_err());
        assert!(validate_sql_identifier("\"quoted\"", "test").is_err());
        assert!(validate_sql_identifier("123table", "test").is_err());
        assert!(validate_sql_identifier(&"a".repeat(64), "test").is_err());
    }

    #[test]
    fn test_qualified_names() {
        assert!(validate_qualified_name("orders", "table").is_ok());
        assert!(validate_qualified_name("shop.orders", "table").is_ok());
        assert!(validate_qualified_name("a.b.c", "table").is_err());
        assert!(validate_qualified_name("shop.", "table").is_err());
    }

    #[test]
    fn test_column_list_must_not_be_empty() {
        assert!(validate_column_list(&[], "foreign_key").is_err());
        assert!(validate_column_list(&["order_id".to_string()], "foreign_key").is_ok());
        assert!(validate_column_list(&["order id".to_string()], "foreign_key").is_err());
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_ident("orders"), "\"orders\"");
        assert_eq!(quote_qualified("shop.orders_draft"), "\"shop\".\"orders_draft\"");
    }

    #[test]
    fn test_sanitize_truncates() {
        let long = "x".repeat(80);
        let sanitized = sanitize_for_logging(&long);
        assert!(sanitized.ends_with("..."));
        assert_eq!(sanitized.len(), 53);
    }
}
