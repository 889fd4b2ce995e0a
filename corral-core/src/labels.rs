//! Label selection for list and watch queries

use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    iter::FromIterator,
};

type Map = BTreeMap<String, String>;
type Expressions = Vec<Expression>;

/// A selector expression over resource labels.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum Expression {
    /// Key's value is one of the listed values.
    In(String, BTreeSet<String>),
    /// Key is absent, or its value is none of the listed values.
    NotIn(String, BTreeSet<String>),
    /// Key's value equals the value.
    Equal(String, String),
    /// Key is absent or its value differs.
    NotEqual(String, String),
    /// Key is present with any value.
    Exists(String),
    /// Key is absent.
    DoesNotExist(String),
}

impl Expression {
    fn matches(&self, labels: &Map) -> bool {
        match self {
            Expression::In(key, values) => match labels.get(key) {
                Some(v) => values.contains(v),
                None => false,
            },
            Expression::NotIn(key, values) => match labels.get(key) {
                Some(v) => !values.contains(v),
                None => true,
            },
            Expression::Exists(key) => labels.contains_key(key),
            Expression::DoesNotExist(key) => !labels.contains_key(key),
            Expression::Equal(key, value) => labels.get(key) == Some(value),
            Expression::NotEqual(key, value) => labels.get(key) != Some(value),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::In(key, values) => {
                let values: Vec<_> = values.iter().cloned().collect();
                write!(f, "{key} in ({})", values.join(","))
            }
            Expression::NotIn(key, values) => {
                let values: Vec<_> = values.iter().cloned().collect();
                write!(f, "{key} notin ({})", values.join(","))
            }
            Expression::Equal(key, value) => write!(f, "{key}={value}"),
            Expression::NotEqual(key, value) => write!(f, "{key}!={value}"),
            Expression::Exists(key) => write!(f, "{key}"),
            Expression::DoesNotExist(key) => write!(f, "!{key}"),
        }
    }
}

/// Perform selection on a list of expressions.
///
/// All expressions must match (conjunction). An empty selector selects
/// everything.
#[derive(Clone, Debug, Eq, PartialEq, Default, Deserialize, Serialize)]
pub struct Selector(Expressions);

impl Selector {
    /// A selector matching everything.
    #[must_use]
    pub fn everything() -> Self {
        Self::default()
    }

    /// Add an expression to the selector.
    #[must_use]
    pub fn with(mut self, expr: Expression) -> Self {
        self.0.push(expr);
        self
    }

    /// Indicates whether this selector matches every resource.
    #[must_use]
    pub fn selects_all(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the labels satisfy every expression.
    #[must_use]
    pub fn matches(&self, labels: &Map) -> bool {
        self.0.iter().all(|expr| expr.matches(labels))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let exprs: Vec<_> = self.0.iter().map(ToString::to_string).collect();
        f.write_str(&exprs.join(","))
    }
}

impl FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| Expression::Equal(k, v))
                .collect(),
        )
    }
}

impl FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<Expression> for Selector {
    fn from(expr: Expression) -> Self {
        Self(vec![expr])
    }
}
