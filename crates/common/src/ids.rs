//! Identifier newtypes shared across the federation.
//!
//! All four identifiers are restricted to ASCII alphanumerics because they
//! are embedded as segments of generated table names (see
//! [`crate::tables::TableName`]) and must parse back out unambiguously.

use std::{
    fmt,
    str::FromStr,
};

use serde::{
    Deserialize,
    Serialize,
};

pub const MAX_ID_LEN: usize = 48;

fn check_id_segment(kind: &'static str, s: &str) -> anyhow::Result<()> {
    anyhow::ensure!(!s.is_empty(), "{kind} cannot be empty");
    anyhow::ensure!(
        s.len() <= MAX_ID_LEN,
        "{kind} {s} is longer than {MAX_ID_LEN} characters"
    );
    anyhow::ensure!(
        s.bytes().all(|b| b.is_ascii_alphanumeric()),
        "{kind} {s} must be ASCII alphanumeric"
    );
    Ok(())
}

macro_rules! id_string {
    ($(#[$attr:meta])* $name:ident, $kind:literal) => {
        $(#[$attr])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> anyhow::Result<Self> {
                check_id_segment($kind, s)?;
                Ok(Self(s.to_owned()))
            }
        }

        impl TryFrom<String> for $name {
            type Error = anyhow::Error;

            fn try_from(s: String) -> anyhow::Result<Self> {
                check_id_segment($kind, &s)?;
                Ok(Self(s))
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        #[cfg(any(test, feature = "testing"))]
        impl proptest::arbitrary::Arbitrary for $name {
            type Parameters = ();
            type Strategy = proptest::strategy::BoxedStrategy<Self>;

            fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
                use proptest::prelude::*;
                "[a-z0-9]{1,12}".prop_map(|s| Self(s)).boxed()
            }
        }
    };
}

id_string!(
    /// An addressable worker, as advertised by its own info task.
    NodeId,
    "node id"
);
id_string!(
    /// Correlates the log lines of one inbound request across services.
    RequestId,
    "request id"
);
id_string!(
    /// One algorithm run's scope. Every artifact the run creates on any
    /// worker embeds this id, which is all cleanup needs to find them.
    ContextId,
    "context id"
);
id_string!(
    /// One step within a context. Allocated by the executor; never reused,
    /// even on retry.
    CommandId,
    "command id"
);

impl RequestId {
    pub fn fresh() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl ContextId {
    pub fn fresh() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl CommandId {
    /// Command ids are sequence numbers within a context.
    pub fn from_sequence(seq: u64) -> Self {
        Self(seq.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_id_validation() {
        assert!(NodeId::from_str("localnode1").is_ok());
        assert!(NodeId::from_str("").is_err());
        assert!(NodeId::from_str("bad-id").is_err());
        assert!(NodeId::from_str("bad_id").is_err());
        assert!(ContextId::from_str(&"x".repeat(MAX_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_fresh_ids_are_valid_segments() {
        let ctx = ContextId::fresh();
        assert!(ContextId::from_str(ctx.as_str()).is_ok());
        let req = RequestId::fresh();
        assert!(RequestId::from_str(req.as_str()).is_ok());
    }

    #[test]
    fn test_serde_rejects_invalid() {
        assert!(serde_json::from_str::<NodeId>("\"ok1\"").is_ok());
        assert!(serde_json::from_str::<NodeId>("\"not ok\"").is_err());
    }
}
