use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

// Minted once per session handle; watch events carrying an older token are stale.
branded_id!(RegistrationToken, "reg");
branded_id!(SubscriptionId, "sub");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_token_has_prefix() {
        let id = RegistrationToken::new();
        assert!(id.as_str().starts_with("reg_"), "got: {id}");
    }

    #[test]
    fn subscription_id_has_prefix() {
        let id = SubscriptionId::new();
        assert!(id.as_str().starts_with("sub_"), "got: {id}");
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(RegistrationToken::new(), RegistrationToken::new());
    }

    #[test]
    fn from_raw_roundtrip() {
        let id = RegistrationToken::from_raw("reg_fixed");
        assert_eq!(id.as_str(), "reg_fixed");
        let parsed: RegistrationToken = "reg_fixed".parse().unwrap();
        assert_eq!(parsed, id);
    }
}
