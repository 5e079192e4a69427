//! Identifier newtypes.
//!
//! Users, devices and rooms are opaque strings assigned by the homeserver.
//! Wrapping them keeps a device id from being passed where a user id is
//! expected.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an identifier string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Identifier as a string slice.
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
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Fully qualified user id, e.g. `@alice:example.org`.
    UserId
);

string_id!(
    /// Device id, unique per user.
    DeviceId
);

string_id!(
    /// Room id, e.g. `!abc:example.org`.
    RoomId
);

/// A (user, device) pair addressing exactly one device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceAddress {
    /// Owning user.
    pub user_id: UserId,
    /// Device of that user.
    pub device_id: DeviceId,
}

impl DeviceAddress {
    /// Address a device.
    pub fn new(user_id: impl Into<UserId>, device_id: impl Into<DeviceId>) -> Self {
        Self { user_id: user_id.into(), device_id: device_id.into() }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_address_display() {
        let addr = DeviceAddress::new("@alice:example.org", "ALICEDEV");
        assert_eq!(addr.to_string(), "@alice:example.org/ALICEDEV");
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let mut buf = Vec::new();
        ciborium::into_writer(&RoomId::from("!room:example.org"), &mut buf).unwrap();
        let decoded: String = ciborium::from_reader(&buf[..]).unwrap();
        assert_eq!(decoded, "!room:example.org");
    }
}
