use serde::{Deserialize, Serialize};

/// The kind of engine object a directory holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    /// A multidimensional array.
    Array,
    /// A group of objects (filesystem containment).
    Group,
    /// A key-value store.
    KeyValue,
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Array => write!(f, "array"),
            Self::Group => write!(f, "group"),
            Self::KeyValue => write!(f, "kv"),
        }
    }
}

/// The traversal order of an object iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WalkOrder {
    /// Parents before children.
    #[default]
    Preorder,
    /// Children before parents.
    Postorder,
}
