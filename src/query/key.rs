use serde::{Deserialize, Serialize};

/// One primary-key value tuple, in key-column order.
///
/// Values are held in their canonical text form (`col::text`), so equality is
/// full-value equality and `["1", "2"]` differs from `["2", "1"]`.
///
/// Example: `KeyTuple::from(["5"])` is the row of `orders` with `id = 5`;
/// `KeyTuple::from(["7", "en"])` a row of a table keyed on `(page_id, locale)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyTuple(Vec<String>);

impl KeyTuple {
    pub fn new(values: Vec<String>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[String] {
        &self.0
    }

    pub fn arity(&self) -> usize {
        self.0.len()
    }
}

impl<S: Into<String>, const N: usize> From<[S; N]> for KeyTuple {
    fn from(values: [S; N]) -> Self {
        Self(values.into_iter().map(Into::into).collect())
    }
}

impl std::fmt::Display for KeyTuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({})", self.0.join(", "))
    }
}
