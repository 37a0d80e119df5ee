//! Identifier types.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Globally unique, time-ordered operation identifier (UUID v7).
///
/// Ordering follows the raw bytes, which matches the lexicographic order
/// of the hyphenated string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpId(Uuid);

impl OpId {
    /// Generates a fresh v7 identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Builds an id from a 128-bit value. Handy for fixtures that need a
    /// known ordering.
    #[must_use]
    pub const fn from_u128(v: u128) -> Self {
        Self(Uuid::from_u128(v))
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Returns the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for OpId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| ProtocolError::InvalidIdentifier {
                kind: "op id",
                value: s.to_string(),
            })
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Validates and wraps `value`. Empty or whitespace-padded
            /// input is rejected.
            pub fn new(value: impl Into<String>) -> ProtocolResult<Self> {
                let value = value.into();
                if value.is_empty() || value.trim() != value {
                    return Err(ProtocolError::InvalidIdentifier { kind: $kind, value });
                }
                Ok(Self(value))
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = ProtocolError;

            fn try_from(value: String) -> ProtocolResult<Self> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }

        impl FromStr for $name {
            type Err = ProtocolError;

            fn from_str(s: &str) -> ProtocolResult<Self> {
                Self::new(s)
            }
        }
    };
}

string_id!(
    /// Identifies one installation. Each device owns one hash chain.
    DeviceId,
    "device id"
);
string_id!(
    /// Identifies the person who recorded an operation.
    ActorId,
    "actor id"
);
string_id!(
    /// Identifies an entity within its entity type.
    EntityId,
    "entity id"
);

/// Kinds of business object the op-log tracks.
///
/// New kinds are added as variants; each one gets its own sync cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    /// A shift handover.
    Shift,
    /// A follow-up action raised during a shift.
    Action,
    /// A piece of equipment.
    Asset,
    /// A free-form log entry.
    Entry,
}

impl EntityType {
    /// Every entity type, in declaration order.
    pub const ALL: [EntityType; 4] = [
        EntityType::Shift,
        EntityType::Action,
        EntityType::Asset,
        EntityType::Entry,
    ];

    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            EntityType::Shift => "shift",
            EntityType::Action => "action",
            EntityType::Asset => "asset",
            EntityType::Entry => "entry",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownEntityType(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_id_order_matches_string_order() {
        let a = OpId::from_u128(0x0190_0000_0000_7000_8000_0000_0000_0001);
        let b = OpId::from_u128(0x0190_0000_0000_7000_8000_0000_0000_0002);
        assert!(a < b);
        assert!(a.to_string() < b.to_string());
        assert_eq!(a.to_string().parse::<OpId>().unwrap(), a);
    }

    #[test]
    fn generated_ids_are_v7() {
        let id = OpId::generate();
        assert_eq!(id.as_uuid().get_version_num(), 7);
    }

    #[test]
    fn string_ids_reject_blank() {
        assert!(DeviceId::new("").is_err());
        assert!(DeviceId::new(" tablet-1").is_err());
        assert_eq!(DeviceId::new("tablet-1").unwrap().as_str(), "tablet-1");
    }

    #[test]
    fn string_ids_validate_on_deserialize() {
        let ok: ActorId = serde_json::from_str("\"supervisor\"").unwrap();
        assert_eq!(ok.as_str(), "supervisor");
        assert!(serde_json::from_str::<ActorId>("\"\"").is_err());
    }

    #[test]
    fn entity_type_names() {
        for t in EntityType::ALL {
            assert_eq!(t.as_str().parse::<EntityType>().unwrap(), t);
        }
        assert!(matches!(
            "crew".parse::<EntityType>(),
            Err(ProtocolError::UnknownEntityType(_))
        ));
        assert_eq!(serde_json::to_string(&EntityType::Shift).unwrap(), "\"shift\"");
    }
}
