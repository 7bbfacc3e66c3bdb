//! Values read from the orchestration server that may be missing.
//!
//! A failed query is represented as [`Observed::Unavailable`] and carried
//! through every computation that depends on it. There is no `Default` and no
//! `unwrap_or_zero`; getting a number out means handling the unavailable case.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unavailable {
    pub reason: String,
}

impl std::fmt::Display for Unavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unavailable: {}", self.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Observed<T> {
    Known(T),
    Unavailable(Unavailable),
}

impl<T> Observed<T> {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Observed::Unavailable(Unavailable {
            reason: reason.into(),
        })
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Observed::Known(_))
    }

    pub fn known(&self) -> Option<&T> {
        match self {
            Observed::Known(v) => Some(v),
            Observed::Unavailable(_) => None,
        }
    }

    pub fn as_ref(&self) -> Observed<&T> {
        match self {
            Observed::Known(v) => Observed::Known(v),
            Observed::Unavailable(u) => Observed::Unavailable(u.clone()),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Observed<U> {
        match self {
            Observed::Known(v) => Observed::Known(f(v)),
            Observed::Unavailable(u) => Observed::Unavailable(u),
        }
    }

    pub fn and_then<U>(self, f: impl FnOnce(T) -> Observed<U>) -> Observed<U> {
        match self {
            Observed::Known(v) => f(v),
            Observed::Unavailable(u) => Observed::Unavailable(u),
        }
    }

    pub fn into_result(self) -> Result<T, Unavailable> {
        match self {
            Observed::Known(v) => Ok(v),
            Observed::Unavailable(u) => Err(u),
        }
    }
}

impl<T, E: std::fmt::Display> From<Result<T, E>> for Observed<T> {
    fn from(value: Result<T, E>) -> Self {
        match value {
            Ok(v) => Observed::Known(v),
            Err(err) => Observed::unavailable(err.to_string()),
        }
    }
}

/// Collects into `Known` only if every element is known; the first unavailable
/// element wins.
impl<T> FromIterator<Observed<T>> for Observed<Vec<T>> {
    fn from_iter<I: IntoIterator<Item = Observed<T>>>(iter: I) -> Self {
        let mut out = Vec::new();
        for item in iter {
            match item {
                Observed::Known(v) => out.push(v),
                Observed::Unavailable(u) => return Observed::Unavailable(u),
            }
        }
        Observed::Known(out)
    }
}
