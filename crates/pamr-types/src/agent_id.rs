//! Agent addressing: numeric AgentIDs and the cookies that guard them.

use crate::error::PamrError;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical address of an agent on a router.
///
/// Ids `0..=4095` are reservable: an operator may ask for one explicitly and
/// protect it with a [`MagicCookie`]. Everything above is handed out by the
/// router on first registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(u32);

impl AgentId {
    /// Highest reservable id.
    pub const MAX_RESERVED: u32 = 4095;
    /// First id the router assigns dynamically.
    pub const MIN_DYNAMIC: u32 = Self::MAX_RESERVED + 1;
    /// Wire value meaning "no id requested, assign one".
    pub const DYNAMIC_SENTINEL: u32 = u32::MAX;
    /// Highest id the router can ever hand out.
    pub const MAX_DYNAMIC: u32 = u32::MAX - 1;

    /// Wrap a raw id. The sentinel value is not a valid address.
    pub fn new(raw: u32) -> Result<Self, PamrError> {
        if raw == Self::DYNAMIC_SENTINEL {
            return Err(PamrError::InvalidAgentId(raw));
        }
        Ok(Self(raw))
    }

    /// Wrap a raw id that must fall in the reservable range.
    pub fn reserved(raw: u32) -> Result<Self, PamrError> {
        if raw > Self::MAX_RESERVED {
            return Err(PamrError::Config(format!(
                "agent id {raw} is outside the reservable range 0..={}",
                Self::MAX_RESERVED
            )));
        }
        Ok(Self(raw))
    }

    /// Raw numeric value, as carried on the wire.
    pub fn get(self) -> u32 {
        self.0
    }

    /// Whether this id belongs to the operator-reservable range.
    pub fn is_reserved(self) -> bool {
        self.0 <= Self::MAX_RESERVED
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared secret proving the right to (re)claim an AgentID.
///
/// Case-sensitive, 1 to 64 Unicode characters.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MagicCookie(String);

impl MagicCookie {
    /// Maximum cookie length in characters.
    pub const MAX_CHARS: usize = 64;
    /// Length of generated cookies.
    const GENERATED_CHARS: usize = 24;

    /// Validate and wrap a cookie value.
    pub fn new(value: impl Into<String>) -> Result<Self, PamrError> {
        let value = value.into();
        let chars = value.chars().count();
        if chars == 0 {
            return Err(PamrError::Config("magic cookie must not be empty".into()));
        }
        if chars > Self::MAX_CHARS {
            return Err(PamrError::Config(format!(
                "magic cookie is {chars} characters long (max {})",
                Self::MAX_CHARS
            )));
        }
        Ok(Self(value))
    }

    /// Generate a random alphanumeric cookie.
    pub fn generate() -> Self {
        let value: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(Self::GENERATED_CHARS)
            .map(char::from)
            .collect();
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

// Cookies are secrets: never print them in full.
impl fmt::Debug for MagicCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.chars().take(2).collect();
        write!(f, "MagicCookie({prefix}***)")
    }
}

impl TryFrom<String> for MagicCookie {
    type Error = PamrError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<MagicCookie> for String {
    fn from(cookie: MagicCookie) -> Self {
        cookie.0
    }
}
