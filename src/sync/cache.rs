//! Read-through response cache keyed by exact request URL.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;
use url::Url;

use super::store::{Slot, Store};
use crate::http::{Headers, HttpResponse};

/// How long a cached response stays usable.
pub const CACHE_TTL_HOURS: i64 = 24;

pub fn cache_ttl() -> Duration {
  Duration::hours(CACHE_TTL_HOURS)
}

/// One cached read result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
  pub url: String,
  pub status: u16,
  #[serde(default)]
  pub headers: Headers,
  pub body: String,
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub saved_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
    now - self.saved_at <= cache_ttl()
  }

  /// Response equivalent to the one that was cached.
  pub fn to_response(&self) -> HttpResponse {
    HttpResponse {
      status: self.status,
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }
}

type CacheMap = BTreeMap<String, CacheEntry>;

/// Response envelopes that hold a list the optimistic merge can prepend to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CollectionShape {
  /// `[...]`
  Array,
  /// `{"data": [...]}`
  Data,
  /// `{"results": [...]}`
  Results,
}

impl CollectionShape {
  fn detect(body: &Value) -> Option<Self> {
    match body {
      Value::Array(_) => Some(Self::Array),
      Value::Object(fields) => {
        if fields.get("data").is_some_and(Value::is_array) {
          Some(Self::Data)
        } else if fields.get("results").is_some_and(Value::is_array) {
          Some(Self::Results)
        } else {
          None
        }
      }
      _ => None,
    }
  }

  fn items_mut(self, body: &mut Value) -> Option<&mut Vec<Value>> {
    match self {
      Self::Array => body.as_array_mut(),
      Self::Data => body.get_mut("data").and_then(Value::as_array_mut),
      Self::Results => body.get_mut("results").and_then(Value::as_array_mut),
    }
  }
}

/// Cache operations over the persisted cache slot.
#[derive(Clone)]
pub struct CacheManager {
  store: Store,
}

impl CacheManager {
  pub fn new(store: Store) -> Self {
    Self { store }
  }

  /// Fresh entry for `url`, if any. Stale entries read as absent.
  pub fn lookup(&self, url: &str) -> Result<Option<CacheEntry>> {
    self.lookup_at(url, Utc::now())
  }

  pub fn lookup_at(&self, url: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry>> {
    let mut cache: CacheMap = self.store.read(Slot::Cache)?;
    Ok(cache.remove(url).filter(|entry| entry.is_fresh_at(now)))
  }

  /// Record a successful read, overwriting any previous entry for `url`.
  pub fn store(&self, url: &str, response: &HttpResponse) -> Result<()> {
    let entry = CacheEntry {
      url: url.to_string(),
      status: response.status,
      headers: response.headers.clone(),
      body: response.body.clone(),
      saved_at: Utc::now().trunc_subsecs(3),
    };
    self.store.modify(Slot::Cache, |cache: &mut CacheMap| {
      cache.insert(url.to_string(), entry);
    })?;
    debug!(url, "Cached response");
    Ok(())
  }

  /// Prepend `item` to every cached collection under the resource that
  /// `url` writes to. Returns how many entries were changed.
  pub fn merge_optimistic(&self, url: &str, item: &Value) -> Result<usize> {
    let prefix = collection_prefix(url);
    let now = Utc::now().trunc_subsecs(3);

    self.store.modify(Slot::Cache, |cache: &mut CacheMap| {
      let mut merged = 0;
      for (key, entry) in cache.iter_mut() {
        if !collection_prefix(key).starts_with(&prefix) {
          continue;
        }

        let mut body: Value = match serde_json::from_str(&entry.body) {
          Ok(body) => body,
          Err(e) => {
            debug!(url = %key, error = %e, "Skipping unparsable cached body");
            continue;
          }
        };

        let Some(items) = CollectionShape::detect(&body).and_then(|shape| shape.items_mut(&mut body))
        else {
          continue;
        };
        items.insert(0, item.clone());

        entry.body = body.to_string();
        entry.saved_at = now;
        merged += 1;
      }
      merged
    })
  }
}

/// `url` without query or fragment, always ending in `/`.
fn collection_prefix(url: &str) -> String {
  let mut base = match Url::parse(url) {
    Ok(mut parsed) => {
      parsed.set_query(None);
      parsed.set_fragment(None);
      parsed.to_string()
    }
    Err(_) => url
      .split(['?', '#'])
      .next()
      .unwrap_or_default()
      .to_string(),
  };
  if !base.ends_with('/') {
    base.push('/');
  }
  base
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn manager() -> CacheManager {
    CacheManager::new(Store::in_memory())
  }

  fn ok(body: &str) -> HttpResponse {
    HttpResponse {
      status: 200,
      headers: Headers::from_iter([("content-type", "application/json"), ("x-total", "1")]),
      body: body.to_string(),
    }
  }

  fn body_of(cache: &CacheManager, url: &str) -> Value {
    let entry = cache.lookup(url).unwrap().unwrap();
    serde_json::from_str(&entry.body).unwrap()
  }

  #[test]
  fn test_lookup_returns_stored_response_verbatim() {
    let cache = manager();
    let response = ok(r#"[{"id":1}]"#);
    cache.store("http://api.test/items/?page=1", &response).unwrap();

    let entry = cache.lookup("http://api.test/items/?page=1").unwrap().unwrap();
    assert_eq!(entry.to_response(), response);
    assert!(cache.lookup("http://api.test/items/").unwrap().is_none());
  }

  #[test]
  fn test_entries_expire_after_ttl() {
    let cache = manager();
    cache.store("http://api.test/items/", &ok("[]")).unwrap();
    let saved_at = cache
      .lookup("http://api.test/items/")
      .unwrap()
      .unwrap()
      .saved_at;

    let at_edge = saved_at + cache_ttl();
    assert!(cache.lookup_at("http://api.test/items/", at_edge).unwrap().is_some());

    let past = at_edge + Duration::milliseconds(1);
    assert!(cache.lookup_at("http://api.test/items/", past).unwrap().is_none());
  }

  #[test]
  fn test_saved_at_survives_reload() {
    let cache = manager();
    let before = Utc::now().trunc_subsecs(3);
    cache.store("http://api.test/items/", &ok("[]")).unwrap();
    let stored = cache.lookup("http://api.test/items/").unwrap().unwrap();
    assert_eq!(stored.saved_at, stored.saved_at.trunc_subsecs(3));
    assert!(stored.saved_at >= before);

    cache
      .merge_optimistic("http://api.test/items/", &json!({"n": 1}))
      .unwrap();
    let merged = cache.lookup("http://api.test/items/").unwrap().unwrap();
    assert_eq!(merged.saved_at, merged.saved_at.trunc_subsecs(3));
  }

  #[test]
  fn test_store_overwrites() {
    let cache = manager();
    cache.store("http://api.test/items/", &ok("[1]")).unwrap();
    cache.store("http://api.test/items/", &ok("[2]")).unwrap();
    assert_eq!(body_of(&cache, "http://api.test/items/"), json!([2]));
  }

  #[test]
  fn test_merge_into_results_envelope() {
    let cache = manager();
    cache
      .store("http://api.test/items", &ok(r#"{"results":[{"id":1}]}"#))
      .unwrap();

    let item = json!({"name": "x", "offline": true, "offline_id": "q1"});
    let merged = cache.merge_optimistic("http://api.test/items", &item).unwrap();

    assert_eq!(merged, 1);
    assert_eq!(
      body_of(&cache, "http://api.test/items"),
      json!({"results": [{"name": "x", "offline": true, "offline_id": "q1"}, {"id": 1}]})
    );
  }

  #[test]
  fn test_merge_covers_every_shape_and_query_variant() {
    let cache = manager();
    cache.store("http://api.test/items/", &ok(r#"[{"id":1}]"#)).unwrap();
    cache
      .store("http://api.test/items/?page=2", &ok(r#"{"data":[],"total":0}"#))
      .unwrap();
    cache.store("http://api.test/items/1", &ok(r#"{"id":1}"#)).unwrap();
    cache.store("http://api.test/other/", &ok("[]")).unwrap();
    cache.store("http://api.test/items/html", &ok("<html>")).unwrap();

    let merged = cache
      .merge_optimistic("http://api.test/items/", &json!({"n": 2}))
      .unwrap();

    assert_eq!(merged, 2);
    assert_eq!(body_of(&cache, "http://api.test/items/"), json!([{"n": 2}, {"id": 1}]));
    assert_eq!(
      body_of(&cache, "http://api.test/items/?page=2"),
      json!({"data": [{"n": 2}], "total": 0})
    );
    assert_eq!(body_of(&cache, "http://api.test/items/1"), json!({"id": 1}));
    assert_eq!(body_of(&cache, "http://api.test/other/"), json!([]));
    assert_eq!(
      cache.lookup("http://api.test/items/html").unwrap().unwrap().body,
      "<html>"
    );
  }

  #[test]
  fn test_merge_refreshes_saved_at() {
    let cache = manager();
    cache.store("http://api.test/items/", &ok("[]")).unwrap();
    let before = cache
      .lookup("http://api.test/items/")
      .unwrap()
      .unwrap()
      .saved_at;

    cache
      .merge_optimistic("http://api.test/items/", &json!({}))
      .unwrap();
    let after = cache
      .lookup("http://api.test/items/")
      .unwrap()
      .unwrap()
      .saved_at;
    assert!(after >= before);
  }

  #[test]
  fn test_collection_prefix() {
    assert_eq!(
      collection_prefix("http://api.test/items?x=1#top"),
      "http://api.test/items/"
    );
    assert_eq!(collection_prefix("http://api.test/items/"), "http://api.test/items/");
    assert_eq!(collection_prefix("/items?x=1"), "/items/");
  }
}
