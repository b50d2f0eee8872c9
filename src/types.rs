//! Identifier newtypes for the resources this crate manages.
//!
//! A [`VmId`] is the fleet pool identifier and stays stable for the life of
//! the VM. The [`InstanceId`] backing it is volatile: the fleet may replace
//! the instance at any time, so it is resolved on demand and never stored as
//! the VM's key.

use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

macro_rules! newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps a raw identifier.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub const fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str(&self.0)
            }
        }
    };
}

newtype!(
    /// Orchestrator-visible VM identity; equal to the fleet pool identifier.
    VmId
);
newtype!(
    /// Persistent disk identity; equal to the cloud API volume identifier.
    DiskId
);
newtype!(
    /// Concrete compute instance currently backing a pool.
    InstanceId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_display_their_raw_value() {
        let vm = VmId::from("sig-1234");
        let disk = DiskId::new(String::from("vol-1"));
        assert_eq!(vm.to_string(), "sig-1234");
        assert_eq!(disk.as_str(), "vol-1");
    }

    #[test]
    fn identifiers_serialise_as_plain_strings() {
        let json = serde_json::to_string(&InstanceId::from("i-abc")).expect("serialise");
        assert_eq!(json, r#""i-abc""#);
    }
}
