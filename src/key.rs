//! Type keys identifying candidate stream representations.

use std::fmt;

/// Identity of one candidate payload representation.
///
/// A key pairs a logical format name (what the payload means) with a
/// wire-compatibility class (how it is laid out on the wire). Two keys are
/// equal only if both components match exactly. Keys are immutable once
/// constructed.
///
/// # Example
///
/// ```rust
/// use concord::key::TypeKey;
///
/// let a = TypeKey::new("sensor/imu", "cbor");
/// let b = TypeKey::new("sensor/imu", "json");
/// assert_ne!(a, b);
/// assert_eq!(a.to_string(), "sensor/imu+cbor");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeKey {
    format: String,
    compat: String,
}

impl TypeKey {
    /// Create a key from a logical format name and a wire-compatibility class.
    pub fn new(format: impl Into<String>, compat: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            compat: compat.into(),
        }
    }

    /// The logical format name.
    pub fn format(&self) -> &str {
        &self.format
    }

    /// The wire-compatibility class.
    pub fn compat(&self) -> &str {
        &self.compat
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.format, self.compat)
    }
}
