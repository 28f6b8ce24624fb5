use serde::{Deserialize, Serialize};
use std::fmt;

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Unsigned(u64),
    Signed(i64),
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        /// Accepts a JSON string or integer; numeric ids are common on the wire.
        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                match RawId::deserialize(deserializer)? {
                    RawId::Text(s) => Ok(Self(s)),
                    RawId::Signed(n) => Ok(Self(n.to_string())),
                    RawId::Unsigned(n) => Ok(Self(n.to_string())),
                }
            }
        }

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Empty ids and the literal strings a loosely-typed client may leak
            /// (`"undefined"`, `"null"`) never name a real entity.
            pub fn is_valid(&self) -> bool {
                !self.0.is_empty() && self.0 != "undefined" && self.0 != "null"
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
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
    };
}

string_id!(
    /// Opaque identifier of a voice channel.
    ChannelId
);

string_id!(
    /// Opaque identifier of a user (and therefore of a remote peer).
    UserId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_id_is_valid_uuid() {
        let id = new_id();
        let parsed = uuid::Uuid::parse_str(&id);
        assert!(parsed.is_ok());
        assert_eq!(parsed.unwrap().get_version_num(), 4);
    }

    #[test]
    fn ids_display_as_inner_string() {
        let channel = ChannelId::new("general");
        assert_eq!(channel.to_string(), "general");
        assert_eq!(channel.as_str(), "general");
    }

    #[test]
    fn placeholder_ids_are_invalid() {
        assert!(UserId::new("42").is_valid());
        assert!(!UserId::new("").is_valid());
        assert!(!UserId::new("undefined").is_valid());
        assert!(!ChannelId::new("null").is_valid());
    }

    #[test]
    fn ids_serialize_transparently() {
        let user = UserId::new("alice");
        let json = serde_json::to_string(&user).unwrap();
        assert_eq!(json, "\"alice\"");
        let back: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, user);
    }

    #[test]
    fn numeric_ids_deserialize_as_strings() {
        let user: UserId = serde_json::from_str("42").unwrap();
        assert_eq!(user.as_str(), "42");
        let channel: ChannelId = serde_json::from_str("-3").unwrap();
        assert_eq!(channel.as_str(), "-3");
    }

    #[test]
    fn user_ids_order_lexicographically() {
        assert!(UserId::new("alice") < UserId::new("bob"));
    }

    #[test]
    fn id_hash() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(ChannelId::new("a"));
        set.insert(ChannelId::from("a"));
        assert_eq!(set.len(), 1);
    }
}
