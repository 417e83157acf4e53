//! Request-body ingestion: decompression, batch parsing and pool admission.
//!
//! This is where backpressure surfaces to the client: parse failures map to
//! HTTP 400, admission failures to HTTP 503. Roots are parsed in full
//! before anything is submitted, but a `QueueFull` mid-fanout does not roll
//! back the clones already admitted.

use std::io::Read;

use flate2::read::{GzDecoder, ZlibDecoder};
use thiserror::Error;

use outpost_pool::Pool;

use crate::request::RequestSpec;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IngestError {
    /// Client-side problem, answered with HTTP 400.
    #[error("{0}")]
    BadRequest(String),

    /// Admission rejected, answered with HTTP 503.
    #[error("{0}")]
    Overloaded(String),
}

fn bad_request(msg: impl Into<String>) -> IngestError {
    IngestError::BadRequest(msg.into())
}

/// Undoes the request's `Content-Encoding`, if any.
pub fn decode_body(body: Vec<u8>, content_encoding: Option<&str>) -> Result<Vec<u8>, IngestError> {
    match content_encoding {
        None | Some("identity") => Ok(body),
        Some("gzip") => {
            let mut decoded = Vec::new();
            GzDecoder::new(body.as_slice())
                .read_to_end(&mut decoded)
                .map_err(|err| bad_request(format!("invalid gzip body: {err}")))?;
            Ok(decoded)
        }
        Some("deflate") => {
            let mut decoded = Vec::new();
            ZlibDecoder::new(body.as_slice())
                .read_to_end(&mut decoded)
                .map_err(|err| bad_request(format!("invalid deflate body: {err}")))?;
            Ok(decoded)
        }
        Some(other) => Err(bad_request(format!("unsupported content encoding '{other}'"))),
    }
}

/// Parses a decoded body into validated root specs. The body is either one
/// JSON object or an array of them.
pub fn parse_jobs(body: &[u8]) -> Result<Vec<RequestSpec>, IngestError> {
    if body.len() < 2 {
        return Err(bad_request("Invalid post body"));
    }
    let mut roots: Vec<RequestSpec> = match body[0] {
        b'[' => serde_json::from_slice(body).map_err(|err| bad_request(err.to_string()))?,
        b'{' => {
            let root = serde_json::from_slice(body).map_err(|err| bad_request(err.to_string()))?;
            vec![root]
        }
        _ => return Err(bad_request("Invalid json data")),
    };
    for root in &mut roots {
        root.normalize()
            .map_err(|err| bad_request(err.to_string()))?;
    }
    Ok(roots)
}

/// Fans out every root and admits the resulting jobs in order. Stops at the
/// first admission failure.
pub fn submit_all(pool: &Pool, roots: Vec<RequestSpec>) -> Result<(), IngestError> {
    for root in roots {
        for job in root.fanout() {
            pool.submit("http", job)
                .map_err(|err| IngestError::Overloaded(err.to_string()))?;
        }
    }
    Ok(())
}
