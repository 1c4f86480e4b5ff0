use std::fmt;

use sha2::{Digest, Sha256};

/// Compiled Python source, ready for the execution engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Script {
    source: String,
}

impl Script {
    pub(crate) fn new(source: String) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn into_source(self) -> String {
        self.source
    }

    /// Hex SHA-256 of the source. Equal feature lists give equal digests.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.source.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl AsRef<str> for Script {
    fn as_ref(&self) -> &str {
        &self.source
    }
}
