//! Common identifier types shared by the engine and its environments.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Stable identifier of a fixed sensor node.
///
/// Nodes are usually named after their radio MAC address
/// (e.g. `"24:6f:28:aa:10:01"`), but any stable string works.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

/// Stable identifier of a tracked entity (the transmitter being located).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            /// Creates an identifier from anything string-like.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(NodeId);
string_id!(EntityId);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_ids_display_and_order() {
        let a = NodeId::new("24:6f:28:aa:10:01");
        let b = NodeId::from("24:6f:28:aa:10:02");
        assert_eq!(a.to_string(), "24:6f:28:aa:10:01");
        assert!(a < b);
    }

    #[test]
    fn test_ids_borrow_as_str() {
        let mut map = HashMap::new();
        map.insert(EntityId::from("phone-1"), 7);
        assert_eq!(map.get("phone-1"), Some(&7));
    }
}
