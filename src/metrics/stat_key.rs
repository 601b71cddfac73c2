//! Metric identity: `name,tag1=v1,tag2=v2`.
//!
//! Tag keys are sorted alphabetically and neither keys nor values contain
//! commas. The aggregation core treats the whole string as an opaque map key;
//! only sinks that care about dimensions parse the suffix.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatKey(String);

impl StatKey {
    pub fn new(key: impl Into<String>) -> Self {
        StatKey(key.into())
    }

    /// Build a key from a name and tag pairs, sorting the tags by key.
    pub fn with_tags<'a, I>(name: &str, tags: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let sorted: BTreeMap<&str, &str> = tags.into_iter().collect();
        let mut key = name.to_string();
        for (k, v) in sorted {
            key.push(',');
            key.push_str(k);
            key.push('=');
            key.push_str(v);
        }
        StatKey(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn name(&self) -> &str {
        self.0.split(',').next().unwrap_or_default()
    }

    pub fn has_tags(&self) -> bool {
        self.0.contains(',')
    }

    /// Parse the tag suffix. Pairs without an `=` are ignored.
    pub fn tags(&self) -> BTreeMap<&str, &str> {
        self.0
            .split(',')
            .skip(1)
            .filter_map(|pair| pair.split_once('='))
            .collect()
    }
}

impl fmt::Display for StatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for StatKey {
    fn from(s: String) -> Self {
        StatKey(s)
    }
}

impl From<&str> for StatKey {
    fn from(s: &str) -> Self {
        StatKey(s.to_string())
    }
}

impl Borrow<str> for StatKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}
