use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Server-assigned ids start at 1; zero and negatives never name a real row.
            pub fn is_usable(self) -> bool {
                self.0 > 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(MessageId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE", from = "Option<String>")]
pub enum Role {
    #[default]
    Alumno,
    Tutor,
    Admin,
}

impl From<Option<String>> for Role {
    fn from(value: Option<String>) -> Self {
        value.as_deref().map(Role::from).unwrap_or_default()
    }
}

impl From<&str> for Role {
    fn from(value: &str) -> Self {
        match value {
            "TUTOR" => Role::Tutor,
            "ADMIN" => Role::Admin,
            _ => Role::Alumno,
        }
    }
}

/// The conversation scope a message belongs to.
///
/// Private channels are keyed by the *other* participant, never by the
/// session's own user id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelKey {
    Public,
    Private { peer_id: UserId },
}

impl ChannelKey {
    pub fn private(peer_id: UserId) -> Self {
        ChannelKey::Private { peer_id }
    }

    pub fn peer_id(self) -> Option<UserId> {
        match self {
            ChannelKey::Public => None,
            ChannelKey::Private { peer_id } => Some(peer_id),
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKey::Public => f.write_str("public"),
            ChannelKey::Private { peer_id } => write!(f, "private:{peer_id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_roles_fall_back_to_student() {
        let role: Role = serde_json::from_str("\"SUPERUSER\"").expect("role");
        assert_eq!(role, Role::Alumno);
        let role: Role = serde_json::from_str("\"TUTOR\"").expect("role");
        assert_eq!(role, Role::Tutor);
        let role: Role = serde_json::from_str("null").expect("role");
        assert_eq!(role, Role::Alumno);
        assert_eq!(serde_json::to_string(&Role::Admin).expect("ser"), "\"ADMIN\"");
    }

    #[test]
    fn channel_keys_render_for_logs() {
        assert_eq!(ChannelKey::Public.to_string(), "public");
        assert_eq!(ChannelKey::private(UserId(7)).to_string(), "private:7");
        assert_eq!(ChannelKey::private(UserId(7)).peer_id(), Some(UserId(7)));
    }

    #[test]
    fn zero_ids_are_not_usable() {
        assert!(!UserId(0).is_usable());
        assert!(!UserId(-3).is_usable());
        assert!(UserId(1).is_usable());
    }
}
