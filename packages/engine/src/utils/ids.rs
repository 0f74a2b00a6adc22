// packages/engine/src/utils/ids.rs
//! Strongly typed identifiers
//!
//! Every identifier is a prefixed ULID string (`inst_01HV...`), so ids sort by
//! creation time and are recognisable in logs.

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh identifier
            pub fn generate() -> Self {
                Self(format!("{}_{}", $prefix, Ulid::new().to_string().to_lowercase()))
            }

            /// Wrap an existing identifier string
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

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
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_id!(
    /// Identifier of a managed agent instance
    InstanceId,
    "inst"
);
define_id!(
    /// Identifier of one graph execution
    ExecutionId,
    "exec"
);
define_id!(
    /// Identifier of an immutable checkpoint
    CheckpointId,
    "ckpt"
);
define_id!(
    /// Identifier of a graph definition
    GraphId,
    "graph"
);
define_id!(
    /// Identifier of a warm pool entry
    PoolEntryId,
    "pool"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_prefixed_and_unique() {
        let a = InstanceId::generate();
        let b = InstanceId::generate();
        assert!(a.as_str().starts_with("inst_"));
        assert_ne!(a, b);
        assert!(CheckpointId::generate().as_str().starts_with("ckpt_"));
    }

    #[test]
    fn test_serde_is_transparent() {
        let id = ExecutionId::new("exec_fixed");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"exec_fixed\"");
        let back: ExecutionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
