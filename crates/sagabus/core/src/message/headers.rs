//! Message headers with case-insensitive keys.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Header key carrying the saga instance UID. Authoritative for routing a
/// message to its instance.
pub const SAGA_UID_HEADER: &str = "saga_uid";

/// Header key carrying the codec content type.
pub const CONTENT_TYPE_HEADER: &str = "content-type";

/// Header used by endpoints to ask the transport for a delayed delivery,
/// in milliseconds.
pub const DELAY_MS_HEADER: &str = "x-delay-ms";

/// String headers attached to an envelope. Keys are folded to lowercase on
/// insert, so lookups are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers {
    entries: HashMap<String, String>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        self.entries
            .insert(key.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, key: impl AsRef<str>) -> Option<&str> {
        self.entries
            .get(&key.as_ref().to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn contains(&self, key: impl AsRef<str>) -> bool {
        self.entries.contains_key(&key.as_ref().to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copy all entries from `other`, overwriting existing keys.
    pub fn merge(&mut self, other: &Headers) {
        for (key, value) in other.iter() {
            self.entries.insert(key.to_string(), value.to_string());
        }
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (key, value) in iter {
            headers.set(key, value);
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_case_insensitive() {
        let mut headers = Headers::new();
        headers.set("Saga_UID", "s1");

        assert_eq!(headers.get("saga_uid"), Some("s1"));
        assert_eq!(headers.get("SAGA_UID"), Some("s1"));
        assert!(headers.contains("Saga_Uid"));
    }

    #[test]
    fn set_with_different_casing_overwrites() {
        let mut headers = Headers::new();
        headers.set("Content-Type", "application/json");
        headers.set("content-type", "text/plain");

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get(CONTENT_TYPE_HEADER), Some("text/plain"));
    }

    #[test]
    fn merge_overwrites_existing_keys() {
        let mut base = Headers::new();
        base.set("a", "1");
        base.set("b", "2");

        let mut other = Headers::new();
        other.set("B", "3");
        other.set("c", "4");

        base.merge(&other);
        assert_eq!(base.get("a"), Some("1"));
        assert_eq!(base.get("b"), Some("3"));
        assert_eq!(base.get("c"), Some("4"));
    }
}
