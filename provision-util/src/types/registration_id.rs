use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::ops::Deref;
use std::str::FromStr;
use thiserror::Error;

/// Longest registration id accepted by the provisioning service
const MAX_LEN: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
#[error(
    "invalid registration id '{0}': expected 1 to 128 lowercase alphanumeric characters or hyphens"
)]
pub struct InvalidRegistrationId(String);

/// Identifier of an individual enrollment in DPS.
///
/// Only lowercase ASCII letters, digits and hyphens are allowed. The value is
/// validated on construction so any `RegistrationId` can be sent to the
/// service as is.
#[derive(Serialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(String);

impl RegistrationId {
    pub fn is_valid(value: &str) -> bool {
        !value.is_empty()
            && value.len() <= MAX_LEN
            && value
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    }
}

impl Deref for RegistrationId {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for RegistrationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RegistrationId {
    type Err = InvalidRegistrationId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if Self::is_valid(s) {
            Ok(Self(s.to_owned()))
        } else {
            Err(InvalidRegistrationId(s.to_owned()))
        }
    }
}

impl TryFrom<String> for RegistrationId {
    type Error = InvalidRegistrationId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if Self::is_valid(&value) {
            Ok(Self(value))
        } else {
            Err(InvalidRegistrationId(value))
        }
    }
}

impl<'de> Deserialize<'de> for RegistrationId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.try_into().map_err(serde::de::Error::custom)
    }
}

impl From<RegistrationId> for String {
    fn from(value: RegistrationId) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_lowercase_alphanumeric_with_hyphens() {
        for id in ["device-001", "abc", "0", "-edge-", "a1b2c3"] {
            assert!(id.parse::<RegistrationId>().is_ok(), "{id} should be valid");
        }
    }

    #[test]
    fn rejects_uppercase_spaces_and_symbols() {
        for id in [
            "Device-001",
            "device 001",
            "device_001",
            "device.001",
            "device@001",
            "dévice",
            "",
        ] {
            assert_eq!(
                id.parse::<RegistrationId>(),
                Err(InvalidRegistrationId(id.to_owned())),
                "{id} should be invalid"
            );
        }
    }

    #[test]
    fn rejects_ids_longer_than_limit() {
        let long = "a".repeat(MAX_LEN + 1);
        assert!(long.parse::<RegistrationId>().is_err());
        assert!("a".repeat(MAX_LEN).parse::<RegistrationId>().is_ok());
    }

    #[test]
    fn deserialization_validates() {
        let id: RegistrationId = serde_json::from_str(r#""edge-01""#).unwrap();
        assert_eq!(id.as_str(), "edge-01");
        assert!(serde_json::from_str::<RegistrationId>(r#""Edge 01""#).is_err());
    }
}
