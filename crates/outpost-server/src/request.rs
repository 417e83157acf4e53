//! Wire-level job descriptions.
//!
//! A [`RequestSpec`] is one outbound HTTP request as submitted by a client.
//! A root spec may carry `clones`: child specs that inherit every unset
//! field from the root and are submitted as independent jobs, while the
//! root itself is not executed. See [`RequestSpec::fanout`].

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("invalid request, clones may only be set on the root request")]
    NestedClones,

    #[error("invalid request, url is not set")]
    MissingUrl,
}

/// One outbound HTTP request. Unknown JSON fields are ignored; `body`
/// travels base64-encoded on the wire and is decoded during parsing.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestSpec {
    pub url: String,
    pub method: String,
    #[serde(deserialize_with = "base64_body")]
    pub body: Option<Bytes>,
    pub parameters: Option<HashMap<String, String>>,
    pub headers: Option<HashMap<String, String>>,
    pub host_metrics: bool,
    pub clones: Vec<RequestSpec>,
}

fn base64_body<'de, D>(deserializer: D) -> Result<Option<Bytes>, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded: Option<String> = Option::deserialize(deserializer)?;
    match encoded {
        None => Ok(None),
        Some(encoded) => BASE64
            .decode(encoded.as_bytes())
            .map(|raw| Some(Bytes::from(raw)))
            .map_err(|_| serde::de::Error::custom("invalid request, body must be base64 encoded")),
    }
}

impl RequestSpec {
    /// Validates a freshly parsed root and applies the root-level method
    /// default. Clone methods stay empty so they can inherit.
    pub fn normalize(&mut self) -> Result<(), RequestError> {
        if self.clones.iter().any(|c| !c.clones.is_empty()) {
            return Err(RequestError::NestedClones);
        }
        if self.url.is_empty() && self.clones.is_empty() {
            return Err(RequestError::MissingUrl);
        }
        if self.method.is_empty() {
            self.method = "GET".to_string();
        }
        Ok(())
    }

    /// Materializes the jobs this root stands for.
    ///
    /// Without clones that is the root itself. With clones, each clone
    /// inherits the root's unset fields and is returned in declaration
    /// order; the root is consumed and not executed.
    pub fn fanout(mut self) -> Vec<RequestSpec> {
        if self.clones.is_empty() {
            return vec![self];
        }
        let clones = std::mem::take(&mut self.clones);
        let parent = self;
        clones
            .into_iter()
            .map(|mut clone| {
                clone.inherit(&parent);
                clone
            })
            .collect()
    }

    fn inherit(&mut self, parent: &RequestSpec) {
        if self.url.is_empty() {
            self.url = parent.url.clone();
        }
        if self.method.is_empty() {
            self.method = parent.method.clone();
        }
        if self.body.is_none() {
            // Bytes clones share the buffer, so a fanned-out body is not
            // copied per clone.
            self.body = parent.body.clone();
        }
        merge_missing(&mut self.parameters, &parent.parameters);
        merge_missing(&mut self.headers, &parent.headers);
        if parent.host_metrics {
            self.host_metrics = true;
        }
    }
}

/// Copies parent entries the child does not override; the child wins on
/// conflicting keys.
fn merge_missing(
    child: &mut Option<HashMap<String, String>>,
    parent: &Option<HashMap<String, String>>,
) {
    match (child.as_mut(), parent) {
        (Some(child), Some(parent)) => {
            for (key, value) in parent {
                child
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
        }
        (None, Some(parent)) => *child = Some(parent.clone()),
        _ => {}
    }
}
