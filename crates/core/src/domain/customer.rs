use std::fmt;

use serde::{Deserialize, Serialize};

const MAX_USER_ID_LEN: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A well-formed id is non-empty, at most 64 characters, and limited to
    /// ASCII alphanumerics plus `_`, `-` and `.`.
    pub fn is_well_formed(&self) -> bool {
        let value = self.0.as_str();
        !value.is_empty()
            && value.len() <= MAX_USER_ID_LEN
            && value.chars().all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'))
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
