//! In-process transport double for unit tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::http::{Headers, HttpRequest, HttpResponse, Method, Transport};

enum Scripted {
  Respond(HttpResponse),
  Fail,
}

/// One request as the transport saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
  pub method: Method,
  pub url: String,
  pub headers: Headers,
  pub body: Option<String>,
}

/// Transport that answers from per-URL scripts and records every call.
///
/// Scripted outcomes for a URL are consumed in order; an unscripted call
/// answers `200 {}`.
#[derive(Default)]
pub struct ScriptedTransport {
  scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
  calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, url: &str, status: u16, body: &str) {
    let response = HttpResponse {
      status,
      headers: Headers::from_iter([("content-type", "application/json")]),
      body: body.to_string(),
    };
    self.push(url, Scripted::Respond(response));
  }

  pub fn fail(&self, url: &str) {
    self.push(url, Scripted::Fail);
  }

  pub fn calls(&self) -> Vec<RecordedCall> {
    self.calls.lock().unwrap().clone()
  }

  fn push(&self, url: &str, outcome: Scripted) {
    self
      .scripts
      .lock()
      .unwrap()
      .entry(url.to_string())
      .or_default()
      .push_back(outcome);
  }
}

#[async_trait]
impl Transport for ScriptedTransport {
  async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
    let url = request.url.to_string();
    self.calls.lock().unwrap().push(RecordedCall {
      method: request.method,
      url: url.clone(),
      headers: request.headers,
      body: request.body,
    });

    let next = self
      .scripts
      .lock()
      .unwrap()
      .get_mut(&url)
      .and_then(VecDeque::pop_front);

    match next {
      Some(Scripted::Respond(response)) => Ok(response),
      Some(Scripted::Fail) => Err(eyre!("connection refused: {}", url)),
      None => Ok(HttpResponse {
        status: 200,
        headers: Headers::new(),
        body: "{}".to_string(),
      }),
    }
  }
}
