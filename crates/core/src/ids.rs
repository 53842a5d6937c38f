//! Strongly typed identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a new random ID.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Parse from a string.
            pub fn parse(s: &str) -> crate::Result<Self> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| crate::Error::InvalidId(format!("invalid {}: {e}", $label)))
            }

            /// Get the underlying UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Consume into the underlying UUID.
            pub fn into_uuid(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl FromStr for $name {
            type Err = crate::Error;

            fn from_str(s: &str) -> crate::Result<Self> {
                Self::parse(s)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Identifier of the user that owns sessions, objects and quota.
    ///
    /// Supplied by the authentication layer; this crate never mints user IDs
    /// outside of tests.
    UserId,
    "user ID"
);

uuid_id!(
    /// Identifier of a resumable upload session.
    SessionId,
    "session ID"
);

uuid_id!(
    /// Identifier of an import job.
    JobId,
    "job ID"
);

uuid_id!(
    /// Identifier of a catalogued object.
    ObjectId,
    "object ID"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_roundtrip() {
        let id = SessionId::new();
        let parsed = SessionId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.as_uuid(), parsed.as_uuid());
    }

    #[test]
    fn test_id_parse_rejects_garbage() {
        let err = JobId::parse("not-a-uuid").unwrap_err();
        assert!(err.to_string().contains("invalid job ID"));
    }

    #[test]
    fn test_id_serializes_as_plain_uuid() {
        let uuid = Uuid::new_v4();
        let id = UserId::from_uuid(uuid);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{uuid}\""));
        let back: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
