//! Transport collaborator: opens an event stream and yields its body as lines.

use crate::error::StreamError;
use crate::sse::LineDecoder;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};
use futures::FutureExt;
use http::HeaderMap;
use std::time::Duration;

/// Protocol header names
pub const HEADER_LAST_EVENT_ID: &str = "last-event-id";
pub(crate) const HEADER_CONTENT_TYPE: &str = "content-type";
pub(crate) const HEADER_CACHE_CONTROL: &str = "cache-control";

pub(crate) const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

/// Lazy sequence of response body lines, without line terminators.
///
/// The sequence ends when the server closes the stream and yields an error if
/// the connection fails.
pub type LineStream = BoxStream<'static, Result<String, StreamError>>;

/// A request to open the event stream.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub url: String,
    pub headers: HeaderMap,
}

impl StreamRequest {
    /// The resumption token carried by this request.
    pub fn last_event_id(&self) -> Option<&str> {
        self.headers
            .get(HEADER_LAST_EVENT_ID)
            .and_then(|v| v.to_str().ok())
    }
}

/// Opens event streams.
///
/// Implementations report failures with the [`StreamError`] variant that
/// classifies them: connection problems as [`StreamError::Transport`], rejected
/// responses as [`StreamError::Status`].
pub trait Transport: Send + Sync + 'static {
    fn open(&self, request: StreamRequest) -> BoxFuture<'static, Result<LineStream, StreamError>>;

    /// Release resources held for the client. Called once from `close()`.
    fn release(&self) {}
}

/// [`Transport`] over HTTP using `reqwest`.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport. `connect_timeout` bounds connection setup only; the
    /// response body may stay open indefinitely.
    pub fn new(connect_timeout: Option<Duration>) -> Result<Self, StreamError> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(1)
            .pool_idle_timeout(Duration::from_secs(90));

        if let Some(timeout) = connect_timeout {
            builder = builder.connect_timeout(timeout);
        }

        let client = builder.build()?;
        Ok(Self { client })
    }

    /// Use an existing `reqwest` client.
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Transport for HttpTransport {
    fn open(&self, request: StreamRequest) -> BoxFuture<'static, Result<LineStream, StreamError>> {
        let client = self.client.clone();
        async move {
            let resp = client
                .get(&request.url)
                .headers(request.headers)
                .send()
                .await?;

            let status = resp.status();
            if !status.is_success() {
                return Err(StreamError::Status {
                    status: status.as_u16(),
                    url: request.url,
                });
            }

            Ok(decode_lines(resp.bytes_stream()))
        }
        .boxed()
    }
}

/// Turn a stream of byte chunks into a [`LineStream`].
///
/// A final line without a terminator is still yielded. After an error the
/// stream ends.
pub fn decode_lines<S, E>(bytes: S) -> LineStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<StreamError> + 'static,
{
    struct State {
        bytes: BoxStream<'static, Result<Bytes, StreamError>>,
        decoder: LineDecoder,
        done: bool,
    }

    let state = State {
        bytes: bytes.map_err(Into::into).boxed(),
        decoder: LineDecoder::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(line) = state.decoder.next_line() {
                return Some((Ok(line), state));
            }
            if state.done {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => state.decoder.push(&chunk),
                Some(Err(err)) => {
                    state.done = true;
                    state.decoder = LineDecoder::new();
                    return Some((Err(err), state));
                }
                None => {
                    state.done = true;
                    let tail = state.decoder.finish()?;
                    return Some((Ok(tail), state));
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted in-memory transport.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// How one `open` call behaves.
    pub(crate) enum Script {
        /// Yield these items, then end cleanly.
        Lines(Vec<Result<String, StreamError>>),
        /// Yield these lines, then never end.
        Hang(Vec<String>),
        /// Yield whatever the test sends; end when the sender is dropped.
        Feed(tokio::sync::mpsc::UnboundedReceiver<Result<String, StreamError>>),
        /// Fail to open.
        Fail(StreamError),
    }

    impl Script {
        pub(crate) fn lines(lines: &[&str]) -> Self {
            Script::Lines(lines.iter().map(|l| Ok(l.to_string())).collect())
        }
    }

    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        scripts: Mutex<VecDeque<Script>>,
        requests: Mutex<Vec<StreamRequest>>,
        releases: AtomicUsize,
    }

    impl ScriptedTransport {
        pub(crate) fn new(scripts: impl IntoIterator<Item = Script>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into_iter().collect()),
                ..Default::default()
            }
        }

        pub(crate) fn requests(&self) -> Vec<StreamRequest> {
            self.requests.lock().clone()
        }

        pub(crate) fn last_event_ids(&self) -> Vec<String> {
            self.requests
                .lock()
                .iter()
                .map(|r| r.last_event_id().unwrap_or_default().to_string())
                .collect()
        }

        pub(crate) fn releases(&self) -> usize {
            self.releases.load(Ordering::SeqCst)
        }
    }

    impl Transport for ScriptedTransport {
        fn open(&self, request: StreamRequest) -> BoxFuture<'static, Result<LineStream, StreamError>> {
            self.requests.lock().push(request);
            let script = self
                .scripts
                .lock()
                .pop_front()
                .unwrap_or_else(|| Script::Fail(StreamError::transport("no scripted response")));

            let result = match script {
                Script::Lines(items) => Ok(stream::iter(items).boxed()),
                Script::Hang(lines) => Ok(stream::iter(lines.into_iter().map(Ok::<String, StreamError>))
                    .chain(stream::pending())
                    .boxed()),
                Script::Feed(rx) => Ok(stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|item| (item, rx))
                })
                .boxed()),
                Script::Fail(err) => Err(err),
            };
            futures::future::ready(result).boxed()
        }

        fn release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_test::{assert_err, assert_ok};

    fn chunks(items: Vec<Result<&'static str, StreamError>>) -> LineStream {
        decode_lines(stream::iter(
            items
                .into_iter()
                .map(|item| item.map(|s| Bytes::from_static(s.as_bytes()))),
        ))
    }

    #[tokio::test]
    async fn test_decode_lines_across_chunks() {
        let lines: Vec<_> = chunks(vec![Ok("id: 1\r\nda"), Ok("ta: a\n\ndata: b")])
            .collect()
            .await;
        let lines: Vec<_> = lines.into_iter().map(|l| l.unwrap()).collect();
        assert_eq!(lines, vec!["id: 1", "data: a", "", "data: b"]);
    }

    #[tokio::test]
    async fn test_decode_lines_stops_after_error() {
        let mut lines = chunks(vec![
            Ok("data: a\npartial"),
            Err(StreamError::transport("reset")),
            Ok("data: never\n"),
        ]);
        assert_eq!(assert_ok!(lines.next().await.unwrap()), "data: a");
        assert_eq!(
            assert_err!(lines.next().await.unwrap()),
            StreamError::transport("reset")
        );
        assert!(lines.next().await.is_none());
    }

    #[tokio::test]
    async fn test_decode_lines_converts_source_errors() {
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"data: a\n")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ]);
        let mut lines = decode_lines(body);
        assert_eq!(assert_ok!(lines.next().await.unwrap()), "data: a");
        let err = assert_err!(lines.next().await.unwrap());
        assert_eq!(err.kind(), crate::error::FailureKind::Transport);
        assert!(lines.next().await.is_none());
    }

    #[test]
    fn test_request_last_event_id() {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_LAST_EVENT_ID, HeaderValue::from_static("17"));
        let request = StreamRequest {
            url: "http://localhost/events".into(),
            headers,
        };
        assert_eq!(request.last_event_id(), Some("17"));
    }

    /// Serve one raw HTTP response and hand back the request head.
    async fn serve_once(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/events", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&head).to_lowercase()
        });
        (url, server)
    }

    #[tokio::test]
    async fn test_http_transport_streams_lines() {
        let (url, server) = serve_once(
            "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\nid: 1\ndata: a\n\n",
        )
        .await;

        let mut headers = HeaderMap::new();
        headers.insert(HEADER_LAST_EVENT_ID, HeaderValue::from_static("7"));
        let transport = assert_ok!(HttpTransport::new(Some(Duration::from_secs(5))));
        let lines = assert_ok!(transport.open(StreamRequest { url, headers }).await);
        let lines: Vec<_> = lines.map(|l| l.unwrap()).collect().await;
        assert_eq!(lines, vec!["id: 1", "data: a", ""]);

        let head = server.await.unwrap();
        assert!(head.starts_with("get /events"));
        assert!(head.contains("last-event-id: 7"));
    }

    #[tokio::test]
    async fn test_http_transport_rejects_status() {
        let (url, _server) = serve_once(
            "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;

        let transport = assert_ok!(HttpTransport::new(None));
        let err = match transport.open(StreamRequest { url, headers: HeaderMap::new() }).await {
            Ok(_) => panic!("expected status error"),
            Err(err) => err,
        };
        assert_eq!(err.status_code(), Some(503));
        assert_eq!(err.kind(), crate::error::FailureKind::Transport);
    }
}
