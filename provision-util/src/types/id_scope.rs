use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::ops::Deref;

/// Scope of a DPS instance, e.g. `0ne00000A0A`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdScope(String);

impl Deref for IdScope {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for IdScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for IdScope {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for IdScope {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}
