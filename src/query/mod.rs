//! Query Builder: key-membership predicates and parameterized statements
//!
//! All SQL in the extension filters rows by a set of primary-key tuples. This
//! module renders that filter:
//!
//! - single-column key: `t."id" IN (CAST($1 AS integer), CAST($2 AS integer))`
//! - composite key:     `(t."page_id", t."locale") IN ((CAST($1 AS integer), CAST($2 AS text)), ...)`
//!
//! Parameters are bound as text and cast in SQL to the key column's type, so a
//! single text parameter list works for every key type. An empty key set
//! renders no predicate at all: callers skip the statement instead of sending
//! an invalid `IN ()`.

pub mod key;

pub use key::KeyTuple;

use crate::error::{PublishError, PublishResult};
use crate::validation::quote_ident;

/// A key column and the SQL type its values are cast to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyColumn {
    pub name: String,
    pub sql_type: String,
}

impl KeyColumn {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
        }
    }
}

/// How composite-key membership is expressed for the target store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeStrategy {
    /// Row-value membership: `(c1, c2) IN ((v1, v2), ...)`
    RowValues,
    /// Expanded form for stores without row-value `IN`:
    /// `((c1 = v1 AND c2 = v2) OR ...)`
    Disjunction,
}

/// A rendered predicate plus the parameters it consumes, in placeholder order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    pub sql: String,
    pub params: Vec<String>,
}

/// A complete parameterized statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<String>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Render `qualifier."column"` (or just `"column"`)
pub fn column_ref(qualifier: Option<&str>, column: &str) -> String {
    match qualifier {
        Some(q) => format!("{q}.{}", quote_ident(column)),
        None => quote_ident(column),
    }
}

/// Comma-separated column references
pub fn column_list(qualifier: Option<&str>, columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| column_ref(qualifier, c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Build a membership predicate of `columns` over `keys`.
///
/// `casts` gives the SQL type per position; it normally comes from the key
/// columns the values were read from, which may differ from `columns` (e.g.
/// a foreign key matched against the referenced primary key).
/// Placeholders start at `$first_param`.
///
/// Returns `Ok(None)` for an empty key set.
pub fn membership(
    qualifier: Option<&str>,
    columns: &[String],
    casts: &[KeyColumn],
    keys: &[KeyTuple],
    first_param: usize,
    strategy: CompositeStrategy,
) -> PublishResult<Option<Predicate>> {
    if columns.is_empty() || columns.len() != casts.len() {
        return Err(crate::internal_error!(
            "membership over {} column(s) with {} cast type(s)",
            columns.len(),
            casts.len()
        ));
    }

    if keys.is_empty() {
        return Ok(None);
    }

    let arity = columns.len();
    let mut params = Vec::with_capacity(keys.len() * arity);
    let mut groups = Vec::with_capacity(keys.len());
    let mut next = first_param;

    for key in keys {
        if key.arity() != arity {
            return Err(PublishError::InvalidInput {
                parameter: "key".to_string(),
                value: key.to_string(),
                reason: format!("expected {} value(s), got {}", arity, key.arity()),
            });
        }

        let mut marks = Vec::with_capacity(arity);
        for (value, cast) in key.values().iter().zip(casts) {
            marks.push(format!("CAST(${} AS {})", next, cast.sql_type));
            params.push(value.clone());
            next += 1;
        }
        groups.push(marks);
    }

    let sql = if arity == 1 {
        let list = groups
            .into_iter()
            .map(|mut g| g.remove(0))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{} IN ({list})", column_ref(qualifier, &columns[0]))
    } else {
        match strategy {
            CompositeStrategy::RowValues => {
                let list = groups
                    .iter()
                    .map(|g| format!("({})", g.join(", ")))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("({}) IN ({list})", column_list(qualifier, columns))
            }
            CompositeStrategy::Disjunction => {
                let terms = groups
                    .iter()
                    .map(|g| {
                        let conj = columns
                            .iter()
                            .zip(g)
                            .map(|(c, mark)| format!("{} = {mark}", column_ref(qualifier, c)))
                            .collect::<Vec<_>>()
                            .join(" AND ");
                        format!("({conj})")
                    })
                    .collect::<Vec<_>>()
                    .join(" OR ");
                format!("({terms})")
            }
        }
    };

    Ok(Some(Predicate { sql, params }))
}

/// Like [`membership`], for statements that cannot be issued without a filter
pub fn require_membership(
    context: &str,
    qualifier: Option<&str>,
    columns: &[String],
    casts: &[KeyColumn],
    keys: &[KeyTuple],
    first_param: usize,
    strategy: CompositeStrategy,
) -> PublishResult<Predicate> {
    membership(qualifier, columns, casts, keys, first_param, strategy)?.ok_or_else(|| {
        PublishError::EmptyKeySet {
            context: context.to_string(),
        }
    })
}

/// Split a key set into statement-sized batches
pub fn batches(keys: &[KeyTuple], per_statement: usize) -> std::slice::Chunks<'_, KeyTuple> {
    keys.chunks(per_statement.max(1))
}

/// Names of a key column list
pub fn key_names(columns: &[KeyColumn]) -> Vec<String> {
    columns.iter().map(|c| c.name.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_key() -> Vec<KeyColumn> {
        vec![KeyColumn::new("id", "integer")]
    }

    fn composite_key() -> Vec<KeyColumn> {
        vec![
            KeyColumn::new("page_id", "integer"),
            KeyColumn::new("locale", "text"),
        ]
    }

    #[test]
    fn test_single_column_membership() {
        let keys = vec![KeyTuple::from(["101"]), KeyTuple::from(["102"])];
        let pred = membership(
            Some("t"),
            &key_names(&int_key()),
            &int_key(),
            &keys,
            1,
            CompositeStrategy::RowValues,
        )
        .unwrap()
        .unwrap();

        assert_eq!(
            pred.sql,
            r#"t."id" IN (CAST($1 AS integer), CAST($2 AS integer))"#
        );
        assert_eq!(pred.params, vec!["101", "102"]);
    }

    #[test]
    fn test_composite_membership_row_values() {
        let keys = vec![KeyTuple::from(["7", "en"]), KeyTuple::from(["7", "fr"])];
        let pred = membership(
            None,
            &key_names(&composite_key()),
            &composite_key(),
            &keys,
            3,
            CompositeStrategy::RowValues,
        )
        .unwrap()
        .unwrap();

        assert_eq!(
            pred.sql,
            r#"("page_id", "locale") IN ((CAST($3 AS integer), CAST($4 AS text)), (CAST($5 AS integer), CAST($6 AS text)))"#
        );
        assert_eq!(pred.params, vec!["7", "en", "7", "fr"]);
    }

    #[test]
    fn test_composite_membership_disjunction() {
        let keys = vec![KeyTuple::from(["7", "en"]), KeyTuple::from(["8", "de"])];
        let pred = membership(
            Some("d"),
            &key_names(&composite_key()),
            &composite_key(),
            &keys,
            1,
            CompositeStrategy::Disjunction,
        )
        .unwrap()
        .unwrap();

        assert_eq!(
            pred.sql,
            r#"((d."page_id" = CAST($1 AS integer) AND d."locale" = CAST($2 AS text)) OR (d."page_id" = CAST($3 AS integer) AND d."locale" = CAST($4 AS text)))"#
        );
        assert_eq!(pred.params, vec!["7", "en", "8", "de"]);
    }

    #[test]
    fn test_foreign_key_columns_use_referenced_casts() {
        let keys = vec![KeyTuple::from(["5"])];
        let pred = membership(
            Some("t"),
            &["order_id".to_string()],
            &[KeyColumn::new("id", "bigint")],
            &keys,
            1,
            CompositeStrategy::RowValues,
        )
        .unwrap()
        .unwrap();

        assert_eq!(pred.sql, r#"t."order_id" IN (CAST($1 AS bigint))"#);
    }

    #[test]
    fn test_empty_key_set_renders_nothing() {
        let pred = membership(
            Some("t"),
            &key_names(&int_key()),
            &int_key(),
            &[],
            1,
            CompositeStrategy::RowValues,
        )
        .unwrap();
        assert!(pred.is_none());

        let err = require_membership(
            "DELETE",
            None,
            &key_names(&int_key()),
            &int_key(),
            &[],
            1,
            CompositeStrategy::RowValues,
        )
        .unwrap_err();
        assert_eq!(err.sqlstate(), "22004");
    }

    #[test]
    fn test_batches_split_large_key_sets() {
        let keys: Vec<KeyTuple> = (0..5).map(|i| KeyTuple::new(vec![i.to_string()])).collect();
        let sizes: Vec<usize> = batches(&keys, 2).map(<[KeyTuple]>::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(batches(&keys, 0).count(), 5);
    }

    #[test]
    fn test_key_arity_is_checked() {
        let keys = vec![KeyTuple::from(["7"])];
        let err = membership(
            None,
            &key_names(&composite_key()),
            &composite_key(),
            &keys,
            1,
            CompositeStrategy::RowValues,
        )
        .unwrap_err();

        assert!(err.to_string().contains("expected 2 value(s), got 1"));
    }
}
