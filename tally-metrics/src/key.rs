//! Encoding of a measurement name and its tags into a single aggregation key.
//!
//! Keys have the form `name\0key1\0value1\0key2\0value2`, with tag keys in sorted order. The
//! encoding is canonical: the same name and tag map always produce the same key, regardless of the
//! order tags were added in. NUL bytes are stripped from all parts before encoding, so the
//! separator can never appear inside a name, tag key or tag value.
//!
//! ```
//! use tally_metrics::{MetricTags, key};
//!
//! let mut tags = MetricTags::new();
//! tags.insert("region".to_owned(), "eu".to_owned());
//! tags.insert("host".to_owned(), "a".to_owned());
//!
//! let encoded = key::encode("requests", Some(&tags));
//! assert_eq!(encoded, "requests\0host\0a\0region\0eu");
//!
//! let (name, decoded) = key::decode(&encoded);
//! assert_eq!(name, "requests");
//! assert_eq!(decoded, Some(tags));
//! ```

use std::borrow::Cow;
use std::fmt;

use crate::protocol::MetricTags;

/// Separator between the name and every tag key and value.
pub const SEPARATOR: char = '\0';

fn clean(part: &str) -> Cow<'_, str> {
    if part.contains(SEPARATOR) {
        Cow::Owned(part.replace(SEPARATOR, ""))
    } else {
        Cow::Borrowed(part)
    }
}

/// Encodes a name and an optional tag map into a canonical key.
///
/// A missing or empty tag map yields the bare name.
pub fn encode(name: &str, tags: Option<&MetricTags>) -> String {
    let tags = tags.into_iter().flatten();
    encode_iter(name, tags.map(|(k, v)| (k.as_str(), v)))
}

/// Encodes a name and arbitrary tag pairs into a canonical key.
///
/// Tag values can be any type implementing `Display`. Pairs are sorted by key after cleaning. If
/// a key occurs more than once, the last value wins.
///
/// ```
/// let key = tally_metrics::key::encode_iter("jobs", [("worker", 3), ("attempt", 1)]);
/// assert_eq!(key, "jobs\0attempt\01\0worker\03");
/// ```
pub fn encode_iter<'a, I, V>(name: &str, tags: I) -> String
where
    I: IntoIterator<Item = (&'a str, V)>,
    V: fmt::Display,
{
    let sorted: MetricTags = tags
        .into_iter()
        .map(|(k, v)| (clean(k).into_owned(), clean(&v.to_string()).into_owned()))
        .collect();

    let name = clean(name);
    let capacity = name.len()
        + sorted
            .iter()
            .map(|(k, v)| k.len() + v.len() + 2)
            .sum::<usize>();

    let mut key = String::with_capacity(capacity);
    key.push_str(&name);
    for (k, v) in &sorted {
        key.push(SEPARATOR);
        key.push_str(k);
        key.push(SEPARATOR);
        key.push_str(v);
    }

    key
}

/// Splits a key into its name and tags.
///
/// Keys without tags, including any string that was not produced by [`encode`], decode to the
/// full name and `None`. A trailing key without a value is ignored.
pub fn decode(key: &str) -> (&str, Option<MetricTags>) {
    let mut parts = key.split(SEPARATOR);
    let name = parts.next().unwrap_or_default();

    let mut tags = MetricTags::new();
    while let (Some(k), Some(v)) = (parts.next(), parts.next()) {
        tags.insert(k.to_owned(), v.to_owned());
    }

    if tags.is_empty() {
        (name, None)
    } else {
        (name, Some(tags))
    }
}
