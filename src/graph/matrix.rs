//! Matrix expansion - one job instance per combination of axis values

use serde::{Deserialize, Serialize};
use std::fmt;

/// One matrix axis with its ordered values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixAxis {
    pub name: String,
    pub values: Vec<String>,
}

/// A concrete assignment of one value per axis.
///
/// Entries keep axis declaration order, so the rendered form is stable
/// and usable as part of an instance id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MatrixCoordinate(Vec<(String, String)>);

impl MatrixCoordinate {
    pub fn new(entries: Vec<(String, String)>) -> Self {
        Self(entries)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Value assigned to an axis, if the coordinate has that axis
    pub fn get(&self, axis: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(name, _)| name == axis)
            .map(|(_, v)| v.as_str())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// True when every axis present in both coordinates carries the same
    /// value. Used by the paired edge policy; coordinates with no shared
    /// axes trivially agree.
    pub fn agrees_with(&self, other: &MatrixCoordinate) -> bool {
        self.entries().all(|(axis, value)| {
            other.get(axis).map_or(true, |other_value| other_value == value)
        })
    }

    /// Replace `{axis}` placeholders in a template with coordinate values
    pub fn interpolate(&self, template: &str) -> String {
        let mut out = template.to_string();
        for (axis, value) in self.entries() {
            out = out.replace(&format!("{{{}}}", axis), value);
        }
        out
    }
}

impl fmt::Display for MatrixCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return Ok(());
        }
        write!(f, "[")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        write!(f, "]")
    }
}

/// Expand axes into the cartesian product of their values.
///
/// Combinations come out in row-major declaration order: the first axis
/// varies slowest. Empty axes produce a single empty coordinate.
pub fn expand(axes: &[MatrixAxis]) -> Vec<MatrixCoordinate> {
    let mut result = vec![Vec::new()];

    for axis in axes {
        let mut next = Vec::with_capacity(result.len() * axis.values.len());
        for combo in &result {
            for value in &axis.values {
                let mut entry: Vec<(String, String)> = combo.clone();
                entry.push((axis.name.clone(), value.clone()));
                next.push(entry);
            }
        }
        result = next;
    }

    result.into_iter().map(MatrixCoordinate).collect()
}
