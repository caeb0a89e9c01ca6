use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// ULID carried in `x-request-id`.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct RequestId(ulid::Ulid);

impl RequestId {
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new())
    }

    /// Reuse the caller's id when it is a valid ULID.
    #[must_use]
    pub fn from_header(value: Option<&str>) -> Self {
        value
            .and_then(|v| ulid::Ulid::from_string(v.trim()).ok())
            .map_or_else(Self::generate, Self)
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl FromStr for RequestId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ulid::Ulid::from_string(s).map(Self)
    }
}

/// Process-unique connection identifier, used as the tracker key.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl ConnId {
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for ConnId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}
