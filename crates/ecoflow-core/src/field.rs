//! Change-tracked device fields

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Value held by a device field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            #[allow(clippy::cast_precision_loss)]
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            Self::Int(v) => Some(*v != 0),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

macro_rules! int_into_field {
    ($($ty:ty),*) => {
        $(impl From<$ty> for FieldValue {
            fn from(v: $ty) -> Self {
                Self::Int(i64::from(v))
            }
        })*
    };
}

int_into_field!(u8, u16, u32, i8, i16, i32);

impl From<f32> for FieldValue {
    fn from(v: f32) -> Self {
        Self::Float(f64::from(v))
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// Current field values of one device instance
///
/// Values only change through [`FieldStore::set`], which records each
/// changed name once per update cycle.
#[derive(Debug, Default)]
pub struct FieldStore {
    values: HashMap<&'static str, FieldValue>,
    updated: Vec<&'static str>,
    changed: bool,
}

impl FieldStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare-and-set; returns whether the value changed
    pub fn set(&mut self, name: &'static str, value: FieldValue) -> bool {
        if self.values.get(name) == Some(&value) {
            return false;
        }
        tracing::trace!("Field {} = {}", name, value);
        self.values.insert(name, value);
        if !self.updated.contains(&name) {
            self.updated.push(name);
        }
        self.changed = true;
        true
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.values.get(name)
    }

    /// Fields changed in the current cycle, in change order
    #[must_use]
    pub fn updated(&self) -> &[&'static str] {
        &self.updated
    }

    /// Whether anything changed in the current cycle
    #[must_use]
    pub fn changed(&self) -> bool {
        self.changed
    }

    /// End the current cycle and return its changed fields
    pub fn take_updated(&mut self) -> Vec<&'static str> {
        self.changed = false;
        std::mem::take(&mut self.updated)
    }

    /// Snapshot of every known value
    #[must_use]
    pub fn snapshot(&self) -> HashMap<&'static str, FieldValue> {
        self.values.clone()
    }
}
