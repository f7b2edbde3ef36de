//! Canonical cache key derivation.
//!
//! Two requests get the same key when they are semantically equivalent for
//! caching purposes: same method and path, same parameter multiset, and
//! range-query timestamps that fall into the same TTL-sized bucket. This is
//! what lets a burst of near-duplicate time-series queries collapse onto a
//! single cache entry.

use std::collections::BTreeMap;
use std::time::Duration;

use http::Method;
use url::form_urlencoded;

/// Builds the cache key for a request: `METHOD:path:normalized-query`.
///
/// The raw query is decoded into a private copy; the request itself is
/// never modified.
pub fn cache_key(method: &Method, path: &str, raw_query: Option<&str>, ttl: Duration) -> String {
    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    if let Some(query) = raw_query {
        for (name, value) in form_urlencoded::parse(query.as_bytes()) {
            params
                .entry(name.into_owned())
                .or_default()
                .push(value.into_owned());
        }
    }

    // Round time parameters so requests skewed by less than one TTL share
    // a key. `time`/`start` round down, `end` rounds up.
    let ttl_secs = ttl.as_secs() as i64;
    if ttl_secs > 0 {
        round_time_param(&mut params, "time", ttl_secs, false);
        round_time_param(&mut params, "start", ttl_secs, false);
        round_time_param(&mut params, "end", ttl_secs, true);
    }

    format!("{}:{}:{}", method, path, normalize_query(params))
}

/// Replaces the values of `name` with a single TTL-boundary-aligned
/// timestamp, parsed from the first value as a floating-point number of
/// seconds. A value that does not parse is left untouched.
fn round_time_param(
    params: &mut BTreeMap<String, Vec<String>>,
    name: &str,
    ttl_secs: i64,
    round_up: bool,
) {
    let Some(values) = params.get_mut(name) else {
        return;
    };
    let Some(first) = values.first() else {
        return;
    };
    let Ok(parsed) = first.parse::<f64>() else {
        return;
    };

    let secs = parsed as i64;
    let rounded = if round_up {
        ((secs + ttl_secs - 1) / ttl_secs) * ttl_secs
    } else {
        (secs / ttl_secs) * ttl_secs
    };
    *values = vec![rounded.to_string()];
}

/// Serializes the parameter set as fully sorted `name=value` pairs joined
/// by `&`: names lexicographically (the map's iteration order), then each
/// value list lexicographically, one pair per value.
fn normalize_query(mut params: BTreeMap<String, Vec<String>>) -> String {
    let mut out = String::with_capacity(128);
    for (name, values) in params.iter_mut() {
        values.sort();
        for value in values.iter() {
            if !out.is_empty() {
                out.push('&');
            }
            out.push_str(name);
            out.push('=');
            out.push_str(value);
        }
    }
    out
}
