//! Metadata value and event types

use std::time::{SystemTime, UNIX_EPOCH};

/// Attribute holding a file record's (percent-escaped) name
pub const NAME_ATTRIBUTE: &str = "name";

/// Attribute holding a file record's last-modified time
pub const TIMESTAMP_ATTRIBUTE: &str = "timestamp";

/// A metadata value as recorded in the pre-load buffer
///
/// Scalars remember the caller's default so that a buffered write of the
/// default can later remove a stored attribute from the loaded document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetadataValue {
    /// Single string value
    Scalar { default: String, value: String },
    /// Ordered list of values
    List(Vec<String>),
}

impl MetadataValue {
    /// Create a scalar value
    pub fn scalar(default: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Scalar {
            default: default.into(),
            value: value.into(),
        }
    }

    /// Create a list value
    pub fn list<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::List(values.into_iter().map(Into::into).collect())
    }

    /// The value this entry overrides the default with, if any
    ///
    /// A scalar equal to its default and an empty list both mean
    /// "no override".
    pub fn effective(&self) -> Option<EffectiveValue<'_>> {
        match self {
            Self::Scalar { default, value } if value != default => {
                Some(EffectiveValue::Scalar(value))
            }
            Self::Scalar { .. } => None,
            Self::List(values) if values.is_empty() => None,
            Self::List(values) => Some(EffectiveValue::List(values)),
        }
    }

}

/// Borrowed view of an overriding value
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EffectiveValue<'a> {
    Scalar(&'a str),
    List(&'a [String]),
}

/// Public load state of a metafile
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetafileState {
    /// No read attempted yet
    Unloaded,
    /// Read queued or in flight
    Loading,
    /// Document is authoritative
    Read,
}

/// Notification delivered to metafile subscribers
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetafileEvent {
    /// Metadata changed for these file names
    Changed(Vec<String>),
    /// The backing document finished loading; any file may have changed
    Ready,
}

/// Current time in whole seconds since the Unix epoch
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Check that a key can be stored
///
/// Keys become XML attribute and element names in the sidecar, so they
/// must be XML names and must not collide with the reserved attributes.
pub fn is_valid_key(key: &str) -> bool {
    is_xml_name(key) && key != NAME_ATTRIBUTE && key != TIMESTAMP_ATTRIBUTE
}

/// Check that a string is an XML name without a namespace prefix
pub fn is_xml_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_alphabetic() || first == '_')
        && chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
}
