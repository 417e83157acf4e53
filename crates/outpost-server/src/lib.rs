//! Outpost server components
//!
//! This crate assembles the proxy: clients POST JSON job descriptions to
//! the web front, the ingestion pipeline parses and fans them out into the
//! worker pool, and the executor performs the outbound HTTP requests.
//!
//! # Components
//!
//! - [`request`] - the wire-level job description ([`RequestSpec`]) with
//!   clone inheritance and fanout
//! - [`executor`] - the `http` action handler: builds, dials and executes
//!   outbound requests and feeds the counters
//! - [`ingest`] - request-body decoding, batch parsing and pool admission
//! - [`http_server`] - the hyper front: `/post/http`, `/metrics`, `/status`
//! - [`config`] - flag/INI settings shared by the CLI and the server
//! - [`lifecycle`] - startup wiring, signal handling, graceful shutdown
//!   and the fd-inheriting re-exec
//!
//! # Data flow
//!
//! `POST /post/http` → [`ingest`] parses → per-job admission into the pool
//! → a worker invokes [`executor`] → the executor resolves and dials
//! through `outpost-net` → the response code is counted.

pub mod config;
pub mod executor;
pub mod graceful;
pub mod http_server;
pub mod ingest;
pub mod lifecycle;
pub mod request;

mod error;

pub use config::Settings;
pub use error::ServerError;
pub use executor::HttpExecutor;
pub use graceful::Listener;
pub use http_server::WebServer;
pub use lifecycle::run;
pub use request::RequestSpec;
