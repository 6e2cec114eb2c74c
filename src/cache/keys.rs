//! Cache key definitions.
//!
//! A key is `prefix + path`, followed by the request's query parameters in
//! canonical form when any survive the blacklist. Parameters are sorted by
//! name so logically identical requests always land on the same entry.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use url::form_urlencoded;

/// Fully-qualified key as stored in the backends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derives [`CacheKey`]s from request paths and query parameters.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    prefix: String,
    blacklist: BTreeSet<String>,
}

impl KeyBuilder {
    pub fn new<I, S>(prefix: impl Into<String>, blacklist: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefix: prefix.into(),
            blacklist: blacklist.into_iter().map(Into::into).collect(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Build a key from already-decoded parameters.
    ///
    /// Repeated names keep their relative value order; only names are sorted.
    pub fn build<'a, I>(&self, path: &str, params: I) -> CacheKey
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut grouped: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (name, value) in params {
            if self.blacklist.contains(name) {
                continue;
            }
            grouped.entry(name).or_default().push(value);
        }

        let mut key = String::with_capacity(self.prefix.len() + path.len());
        key.push_str(&self.prefix);
        key.push_str(path);

        if !grouped.is_empty() {
            let mut serializer = form_urlencoded::Serializer::new(String::new());
            for (name, values) in grouped {
                for value in values {
                    serializer.append_pair(name, value);
                }
            }
            key.push('?');
            key.push_str(&serializer.finish());
        }

        CacheKey(key)
    }

    /// Build a key from a raw (still percent-encoded) query string.
    pub fn build_from_query(&self, path: &str, query: Option<&str>) -> CacheKey {
        let pairs: Vec<(String, String)> = query
            .map(|raw| {
                form_urlencoded::parse(raw.as_bytes())
                    .map(|(name, value)| (name.into_owned(), value.into_owned()))
                    .collect()
            })
            .unwrap_or_default();

        self.build(
            path,
            pairs
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str())),
        )
    }
}
