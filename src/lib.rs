//! Resilient Server-Sent Events client
//!
//! Opens a long-lived `text/event-stream` response, parses its event blocks and
//! keeps the stream alive across failures: every reconnect goes through a retry
//! policy with square-root backoff and resumes from the last event id via
//! `Last-Event-ID`.
//!
//! Parsed events reach consumers two ways: an `on_event` callback, run in stream order off
//! the runtime workers, and a bounded [`DeliveryQueue`] that any task
//! or thread may poll. Only the read loop of the current connection attempt may
//! write to the queue.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use sse_relay::{Callbacks, ClientConfig, StreamingClient, TaskPool};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new("https://sse.dev/test")
//!         .with_header("Authorization", "Bearer token");
//!     let callbacks = Callbacks::new()
//!         .on_event(|event| println!("{}", event.data))
//!         .on_error(|err| eprintln!("stream failed: {err}"));
//!
//!     let client = StreamingClient::new(config, callbacks, TaskPool::current()?)?;
//!     client.connect().await?;
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod error;
mod pool;
mod queue;
mod retry;
mod sse;
mod transport;
mod types;

pub use client::{Callbacks, OnCompleteCallback, OnErrorCallback, OnEventCallback, StreamingClient};
pub use config::ClientConfig;
pub use error::{FailureKind, InvalidHeaderError, StreamError};
pub use pool::TaskPool;
pub use queue::{DeliveryQueue, OwnershipPolicy, WriterToken, DEFAULT_QUEUE_CAPACITY};
pub use retry::{apply_jitter, JitterMode, RetryExecutor, RetryPolicy, RetryPolicyBuilder};
pub use sse::{BlockAssembler, Event, EventParser, LineDecoder, DEFAULT_DATA_FIELD, ID_FIELD};
pub use transport::{decode_lines, HttpTransport, LineStream, StreamRequest, Transport, HEADER_LAST_EVENT_ID};
pub use types::{ConnectionState, INITIAL_RESUMPTION_TOKEN};
