//! Request/response descriptors and the network primitive they travel over.
//!
//! Everything that talks to the remote API goes through a [`Transport`]. The
//! live implementation is [`ReqwestTransport`]; the offline sync layer wraps
//! any transport and presents the same interface.

mod api;
mod transport;

pub use api::{ApiClient, ApiPayload};
pub use reqwest::Method;
pub use transport::{ReqwestTransport, Transport};

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// Ordered header list. Names keep the case they were supplied with;
/// lookups are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
  pub fn new() -> Self {
    Self::default()
  }

  /// Set a header, replacing an existing value with the same name in place.
  pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    let value = value.into();
    match self
      .0
      .iter_mut()
      .find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
    {
      Some(slot) => slot.1 = value,
      None => self.0.push((name, value)),
    }
  }

  /// Add a header after any existing ones, keeping repeated names.
  pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
    self.0.push((name.into(), value.into()));
  }

  /// First value for `name`.
  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .0
      .iter()
      .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
      .map(|(_, value)| value.as_str())
  }

  pub fn contains(&self, name: &str) -> bool {
    self.get(name).is_some()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
  fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
    let mut headers = Headers::new();
    for (name, value) in iter {
      headers.insert(name, value);
    }
    headers
  }
}

/// Outbound request descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
  pub method: Method,
  pub url: Url,
  pub headers: Headers,
  pub body: Option<String>,
}

impl HttpRequest {
  pub fn new(method: Method, url: &str) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid request URL '{}': {}", url, e))?;
    Ok(Self {
      method,
      url,
      headers: Headers::new(),
      body: None,
    })
  }

  pub fn get(url: &str) -> Result<Self> {
    Self::new(Method::GET, url)
  }

  pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name, value);
    self
  }

  pub fn body(mut self, body: impl Into<String>) -> Self {
    self.body = Some(body.into());
    self
  }

  /// GET is the only read verb; everything else mutates.
  pub fn is_read(&self) -> bool {
    self.method == Method::GET
  }
}

/// Response descriptor with the body fully read as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
  pub status: u16,
  pub headers: Headers,
  pub body: String,
}

impl HttpResponse {
  /// Build a JSON response, used for responses synthesized locally.
  pub fn json(status: u16, body: &serde_json::Value) -> Self {
    Self {
      status,
      headers: Headers::from_iter([("Content-Type", "application/json")]),
      body: body.to_string(),
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn is_json(&self) -> bool {
    self
      .headers
      .get("content-type")
      .is_some_and(|ct| ct.to_ascii_lowercase().contains("application/json"))
  }
}
