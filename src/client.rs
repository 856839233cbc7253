//! Streaming client: connection state machine, read loop, and callback dispatch.

use crate::config::ClientConfig;
use crate::error::{InvalidHeaderError, StreamError};
use crate::pool::TaskPool;
use crate::queue::{DeliveryQueue, WriterToken};
use crate::retry::{cancelled, RetryExecutor};
use crate::sse::{BlockAssembler, Event, EventParser};
use crate::transport::{
    HttpTransport, LineStream, StreamRequest, Transport, EVENT_STREAM_CONTENT_TYPE,
    HEADER_CACHE_CONTROL, HEADER_CONTENT_TYPE, HEADER_LAST_EVENT_ID,
};
use crate::types::{ConnectionState, INITIAL_RESUMPTION_TOKEN};
use futures::StreamExt;
use http::header::{HeaderMap, HeaderValue};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::Instrument;

/// Type alias for event callback function.
pub type OnEventCallback = Arc<dyn Fn(Event) + Send + Sync>;
/// Type alias for error callback function.
pub type OnErrorCallback = Arc<dyn Fn(StreamError) + Send + Sync>;
/// Type alias for completion callback function.
pub type OnCompleteCallback = Arc<dyn Fn() + Send + Sync>;

/// User callbacks, all optional.
///
/// Callbacks run one at a time, in stream order, on the blocking threads of the
/// client's [`TaskPool`], never on the task reading the stream. A callback may
/// block without stalling the stream. The client does
/// not observe their outcome: a panicking callback is logged and skipped, so
/// callbacks must handle their own failures.
#[derive(Clone, Default)]
#[must_use]
pub struct Callbacks {
    on_event: Option<OnEventCallback>,
    on_error: Option<OnErrorCallback>,
    on_complete: Option<OnCompleteCallback>,
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_event", &self.on_event.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called for every parsed event.
    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.on_event = Some(Arc::new(callback));
        self
    }

    /// Called once with the failure that ended `connect()`.
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(StreamError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Called once when the client is closed.
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(callback));
        self
    }

    fn invoke(&self, job: Dispatch) {
        match job {
            Dispatch::Event(event) => {
                if let Some(callback) = &self.on_event {
                    callback(event);
                }
            }
            Dispatch::Error(err) => {
                if let Some(callback) = &self.on_error {
                    callback(err);
                }
            }
            Dispatch::Complete => {
                if let Some(callback) = &self.on_complete {
                    callback();
                }
            }
        }
    }
}

enum Dispatch {
    Event(Event),
    Error(StreamError),
    Complete,
}

/// Runs callbacks one at a time on the pool's blocking threads, so a slow
/// callback never holds up a runtime worker.
async fn dispatch_callbacks(
    mut jobs: mpsc::UnboundedReceiver<Dispatch>,
    callbacks: Callbacks,
    pool: Arc<TaskPool>,
) {
    while let Some(job) = jobs.recv().await {
        let callbacks = callbacks.clone();
        let running = match pool.spawn_blocking(move || callbacks.invoke(job)) {
            Ok(running) => running,
            Err(err) => {
                tracing::debug!(error = %err, "callback dispatcher stopped");
                return;
            }
        };
        match running.await {
            Ok(()) => {}
            Err(err) if err.is_panic() => tracing::warn!("callback panicked"),
            Err(_) => return,
        }
    }
}

/// A resumable SSE client.
///
/// `connect()` opens the stream and keeps it open, reconnecting through the
/// retry policy with the latest event id in `Last-Event-ID`. Events are handed
/// to the `on_event` callback and to the [`DeliveryQueue`], which any task or
/// thread may poll.
///
/// Dropping the client closes it.
pub struct StreamingClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    parser: EventParser,
    base_headers: HeaderMap,
    state: Mutex<ConnectionState>,
    resumption_token: Mutex<String>,
    queue: DeliveryQueue,
    transport: Arc<dyn Transport>,
    pool: Arc<TaskPool>,
    dispatcher: mpsc::UnboundedSender<Dispatch>,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for StreamingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingClient")
            .field("target", &self.inner.config.target)
            .field("state", &self.status())
            .field("resumption_token", &self.resumption_token())
            .field("queue", &self.inner.queue)
            .finish()
    }
}

impl StreamingClient {
    /// Create a client that talks HTTP through [`HttpTransport`].
    pub fn new(config: ClientConfig, callbacks: Callbacks, pool: TaskPool) -> Result<Self, StreamError> {
        config.validate()?;
        let transport = HttpTransport::new(config.request_timeout)?;
        Self::with_transport(config, callbacks, pool, Arc::new(transport))
    }

    /// Create a client on a custom transport.
    pub fn with_transport(
        config: ClientConfig,
        callbacks: Callbacks,
        pool: TaskPool,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, StreamError> {
        config.validate()?;

        let mut base_headers = HeaderMap::new();
        base_headers.insert(
            HEADER_CONTENT_TYPE,
            HeaderValue::from_static(EVENT_STREAM_CONTENT_TYPE),
        );
        base_headers.insert(HEADER_CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        for (key, value) in config.header_map()?.iter() {
            base_headers.insert(key.clone(), value.clone());
        }

        let pool = Arc::new(pool);
        let (dispatcher, jobs) = mpsc::unbounded_channel();
        pool.spawn(dispatch_callbacks(jobs, callbacks, pool.clone()))?;

        let (closed, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                parser: EventParser::new(config.field_prefix.clone()),
                queue: DeliveryQueue::new(config.queue_capacity, config.ownership),
                config,
                base_headers,
                state: Mutex::new(ConnectionState::Idle),
                resumption_token: Mutex::new(INITIAL_RESUMPTION_TOKEN.to_string()),
                transport,
                pool,
                dispatcher,
                closed,
            }),
        })
    }

    /// Open the stream and keep it open.
    ///
    /// Resolves with `Ok(())` once [`close`](Self::close) is called. Resolves with
    /// an error when the retry policy gives up or a non-retryable failure occurs;
    /// the client is then closed and `on_error` has been dispatched.
    ///
    /// Fails with [`StreamError::State`] unless the client is idle.
    pub async fn connect(&self) -> Result<(), StreamError> {
        self.inner.begin_connect()?;
        tracing::info!(url = %self.inner.config.target, "connecting");

        let executor = RetryExecutor::new(self.inner.pool.clone())
            .with_cancellation(self.inner.closed.subscribe());
        let inner = self.inner.clone();
        let span = tracing::info_span!("sse", url = %self.inner.config.target);

        let result = executor
            .run(&self.inner.config.retry, move || {
                let inner = inner.clone();
                async move { inner.connect_once().await }.instrument(span.clone())
            })
            .await;

        match result {
            Ok(()) | Err(StreamError::Cancelled) => {
                tracing::info!("stream closed");
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %err, "stream failed");
                if self.inner.shut() {
                    self.inner.transport.release();
                }
                self.inner.dispatch(Dispatch::Error(err.clone()));
                Err(err)
            }
        }
    }

    /// Close the client. Idempotent.
    ///
    /// Stops any running or pending connection attempt, dispatches
    /// `on_complete`, empties the delivery queue and releases the transport.
    pub fn close(&self) {
        if !self.inner.shut() {
            return;
        }
        tracing::info!(url = %self.inner.config.target, "closing");

        self.inner.dispatch(Dispatch::Complete);

        let token = self.inner.queue.claim();
        if let Err(err) = self.inner.queue.clear(&token) {
            tracing::warn!(error = %err, "failed to clear delivery queue");
        }
        drop(token);

        self.inner.transport.release();
    }

    /// Close the client and abort every task it spawned, including pending callbacks.
    pub fn shutdown(&self) {
        self.close();
        self.inner.pool.shutdown();
    }

    /// Current connection state.
    pub fn status(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// The id that will be sent as `Last-Event-ID` on the next connection attempt.
    pub fn resumption_token(&self) -> String {
        self.inner.resumption_token.lock().clone()
    }

    /// Queue of delivered events. Poll it from any task or thread.
    pub fn queue(&self) -> &DeliveryQueue {
        &self.inner.queue
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

impl Drop for StreamingClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn begin_connect(&self) -> Result<(), StreamError> {
        let mut state = self.state.lock();
        match *state {
            ConnectionState::Idle => {
                *state = ConnectionState::Connected;
                Ok(())
            }
            other => Err(StreamError::State {
                state: other,
                op: "connect",
            }),
        }
    }

    /// Move to `Closed` and signal cancellation. Returns false if already closed.
    fn shut(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.is_closed() {
                return false;
            }
            *state = ConnectionState::Closed;
        }
        self.closed.send_replace(true);
        true
    }

    fn dispatch(&self, job: Dispatch) {
        if self.dispatcher.send(job).is_err() {
            tracing::debug!("callback dispatcher stopped, dropping callback");
        }
    }

    fn request(&self) -> Result<StreamRequest, StreamError> {
        let token = self.resumption_token.lock().clone();
        let value = HeaderValue::from_str(&token)
            .map_err(|_| InvalidHeaderError::InvalidValue(token.clone()))?;

        let mut headers = self.base_headers.clone();
        headers.insert(HEADER_LAST_EVENT_ID, value);

        Ok(StreamRequest {
            url: self.config.target.clone(),
            headers,
        })
    }

    /// One connection attempt: open, read until the stream ends or fails.
    ///
    /// Returns `Ok(())` only when the client was closed.
    async fn connect_once(&self) -> Result<(), StreamError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Ok(());
        }

        let token = self.queue.claim();
        let request = self.request()?;
        tracing::debug!(last_event_id = request.last_event_id(), "opening stream");

        let lines = tokio::select! {
            opened = self.transport.open(request) => opened?,
            _ = cancelled(&mut closed) => return Ok(()),
        };

        self.read_loop(lines, &token, &mut closed).await
    }

    async fn read_loop(
        &self,
        mut lines: LineStream,
        token: &WriterToken,
        closed: &mut watch::Receiver<bool>,
    ) -> Result<(), StreamError> {
        let mut blocks = BlockAssembler::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancelled(closed) => return Ok(()),
                next = lines.next() => next,
            };

            match next {
                Some(Ok(line)) => {
                    if let Some(block) = blocks.push(line) {
                        if !self.deliver(&block, token, closed).await? {
                            return Ok(());
                        }
                    }
                }
                Some(Err(err)) => {
                    tracing::debug!(error = %err, "stream failed");
                    return Err(err);
                }
                None => {
                    if let Some(block) = blocks.finish() {
                        if !self.deliver(&block, token, closed).await? {
                            return Ok(());
                        }
                    }
                    tracing::debug!("server ended stream");
                    return Err(StreamError::StreamEnded);
                }
            }
        }
    }

    /// Parse one block and hand the event out. Returns false if the client closed.
    async fn deliver(
        &self,
        block: &[String],
        token: &WriterToken,
        closed: &mut watch::Receiver<bool>,
    ) -> Result<bool, StreamError> {
        let event = self.parser.parse(block);
        if let Some(id) = event.resumption_id() {
            self.advance_token(id);
        }

        self.dispatch(Dispatch::Event(event.clone()));

        let enqueued = tokio::select! {
            res = self.queue.enqueue(token, event) => res,
            _ = cancelled(closed) => return Ok(false),
        };

        match enqueued {
            Ok(true) => Ok(true),
            _ if *closed.borrow() => Ok(false),
            Ok(false) => {
                tracing::warn!("writer token revoked, event not queued");
                Ok(true)
            }
            Err(err) => Err(err),
        }
    }

    fn advance_token(&self, id: &str) {
        if HeaderValue::from_str(id).is_err() {
            tracing::warn!(id, "ignoring event id that cannot be sent as a header");
            return;
        }
        let mut token = self.resumption_token.lock();
        if *token != id {
            *token = id.to_string();
        }
    }
}
