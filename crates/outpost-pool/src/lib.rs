//! Bounded worker pool for outpost
//!
//! This crate provides the job execution backbone of the proxy: a fixed set
//! of worker tasks fed from a bounded FIFO queue by a single dispatcher.
//!
//! # Architecture
//!
//! - Admission ([`Pool::submit`]) is a non-blocking try-send: callers are
//!   rejected with [`PoolError::QueueFull`] or [`PoolError::Closed`], never
//!   blocked. Backpressure surfaces at the submitter.
//! - One dispatcher task pairs queued jobs with idle workers through a
//!   rendezvous channel of worker job slots. This keeps the number of
//!   concurrently executing handlers at or below the pool size and makes
//!   `active_workers()` a trivial observation.
//! - Workers recover handler panics and survive unknown actions; a bad job
//!   can never take the pool down.
//! - [`Pool::shutdown`] drains the queue, stops every worker, and returns
//!   only once no handler is executing.
//!
//! # Handlers
//!
//! Handlers are registered per action name with a concrete payload type and
//! submitted payloads travel as `Box<dyn Any + Send>`. The downcast happens
//! once, inside the registered adapter, so call sites stay typed:
//!
//! ```
//! use outpost_pool::Pool;
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let mut pool = Pool::new(4, 100);
//! pool.register("print", |line: String| async move {
//!     println!("{line}");
//!     Ok(())
//! });
//! pool.start();
//! pool.submit("print", "hello".to_string()).unwrap();
//! pool.shutdown().await;
//! # }
//! ```

mod pool;
mod worker;

pub use pool::{Pool, PoolError};
