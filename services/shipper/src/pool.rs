//! The consumer connection pool.
//!
//! A fixed number of WebSocket connections cycle through an internal
//! channel: `get` borrows one, `put` returns it, unless it is closed or
//! past its age limit, in which case it is released and a replacement is
//! dialed in the background.  Dialing retries forever; an unreachable
//! consumer therefore empties the pool and blocks the publishers, which is
//! the intended backpressure (records stay on the upstream queue).
//!
//! Each connection owns the translation dictionary for its binary frames
//! and the consumer-advertised receive credit.  The dictionary grows
//! without bound on a connection that never rotates; `max_connection_age`
//! is the reclamation mechanism.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use ms_protocol::Dictionary;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ---------------------------------------------------------------------------
// StreamConn
// ---------------------------------------------------------------------------

/// One pooled consumer connection and its per-connection state.
pub struct StreamConn {
    pub ws: WsStream,
    /// String table for the binary encoding; reset only by replacement.
    pub dictionary: Arc<Dictionary>,
    /// Consumer-advertised record-count credit.  Negative until the
    /// consumer first advertises; the publisher then keeps it current.
    pub receive_buffer: i64,
    expires: Option<Instant>,
    closed: bool,
}

impl StreamConn {
    /// Flag the connection for release on the next `put`.
    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn is_expired(&self) -> bool {
        self.expires.is_some_and(|at| Instant::now() >= at)
    }
}

// ---------------------------------------------------------------------------
// StreamPool
// ---------------------------------------------------------------------------

/// Dial parameters shared by every connection the pool creates.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// `ws://HOST:PORT/PATH`
    pub url: String,
    pub username: String,
    pub password: String,
    /// Sleep between failed dial attempts.
    pub retry_timeout: Duration,
    /// Rotate connections older than this; zero never rotates.
    pub max_age: Duration,
}

pub struct StreamPool {
    tx: mpsc::Sender<StreamConn>,
    rx: Mutex<mpsc::Receiver<StreamConn>>,
    config: Arc<PoolConfig>,
}

impl StreamPool {
    /// Create the pool and start filling its `size` slots in the background.
    pub fn new(size: usize, config: PoolConfig) -> Arc<StreamPool> {
        let (tx, rx) = mpsc::channel(size);
        let config = Arc::new(config);
        let pool = Arc::new(StreamPool {
            tx: tx.clone(),
            rx: Mutex::new(rx),
            config: Arc::clone(&config),
        });

        tokio::spawn(async move {
            for _ in 0..size {
                let conn = dial_forever(&config).await;
                if tx.send(conn).await.is_err() {
                    return;
                }
            }
        });

        pool
    }

    /// Borrow a connection, waiting until one is ready.
    pub async fn get(&self) -> StreamConn {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .expect("pool channel is never closed while the pool is alive")
    }

    /// Return a borrowed connection.  A closed or over-age connection is
    /// released and replaced asynchronously so the borrower never waits on
    /// a dial.
    pub async fn put(&self, mut conn: StreamConn) {
        if conn.is_closed() || conn.is_expired() {
            if !conn.is_closed() {
                debug!(
                    max_age_secs = self.config.max_age.as_secs(),
                    "connection exceeded max age; rotating"
                );
            }
            let tx = self.tx.clone();
            let config = Arc::clone(&self.config);
            tokio::spawn(async move {
                let _ = conn.ws.close(None).await;
                drop(conn);
                let replacement = dial_forever(&config).await;
                let _ = tx.send(replacement).await;
            });
        } else {
            // Capacity equals pool size, so this send cannot block.
            let _ = self.tx.send(conn).await;
        }
    }

    /// Block until at least one connection is ready.  Used at startup to
    /// gate the pipeline on consumer reachability.
    pub async fn wait_for_connection(&self) {
        let conn = self.get().await;
        self.put(conn).await;
    }
}

// ---------------------------------------------------------------------------
// Dialing
// ---------------------------------------------------------------------------

/// Dial until it works.  The pool has no bounded attempt count: permanent
/// consumer failure keeps the slot empty and the publishers blocked.
async fn dial_forever(config: &PoolConfig) -> StreamConn {
    loop {
        match dial(config).await {
            Ok(conn) => {
                info!(url = %config.url, "connected to consumer");
                return conn;
            }
            Err(e) => {
                warn!(url = %config.url, error = %e, "unable to connect to consumer; retrying");
                tokio::time::sleep(config.retry_timeout).await;
            }
        }
    }
}

async fn dial(config: &PoolConfig) -> Result<StreamConn, tokio_tungstenite::tungstenite::Error> {
    let mut request = config.url.as_str().into_client_request()?;
    let headers = request.headers_mut();
    headers.insert("Origin", HeaderValue::from_static("http://localhost"));
    if !config.username.is_empty() || !config.password.is_empty() {
        let credentials = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", config.username, config.password));
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("basic {credentials}"))
                .map_err(|e| tokio_tungstenite::tungstenite::Error::HttpFormat(e.into()))?,
        );
    }

    let (ws, _response) = connect_async(request).await?;
    let expires = (!config.max_age.is_zero()).then(|| Instant::now() + config.max_age);
    Ok(StreamConn {
        ws,
        dictionary: Arc::new(Dictionary::new()),
        receive_buffer: -1,
        expires,
        closed: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ms_test_utils::{ConsumerOptions, MockConsumer};

    fn pool_config(url: String, max_age: Duration) -> PoolConfig {
        PoolConfig {
            url,
            username: String::new(),
            password: String::new(),
            retry_timeout: Duration::from_millis(50),
            max_age,
        }
    }

    #[tokio::test]
    async fn pool_fills_to_size_and_recycles() {
        let consumer = MockConsumer::start(ConsumerOptions::default()).await.unwrap();
        let pool = StreamPool::new(2, pool_config(consumer.url(), Duration::ZERO));

        pool.wait_for_connection().await;
        let a = pool.get().await;
        let b = pool.get().await;
        assert_eq!(consumer.connections_accepted(), 2);

        pool.put(a).await;
        pool.put(b).await;
        // Healthy connections are reused, not re-dialed.
        let _ = pool.get().await;
        let _ = pool.get().await;
        assert_eq!(consumer.connections_accepted(), 2);
    }

    #[tokio::test]
    async fn closed_connections_are_replaced() {
        let consumer = MockConsumer::start(ConsumerOptions::default()).await.unwrap();
        let pool = StreamPool::new(1, pool_config(consumer.url(), Duration::ZERO));

        let mut conn = pool.get().await;
        conn.mark_closed();
        pool.put(conn).await;

        // The replacement is a fresh physical connection with fresh state.
        let replacement = pool.get().await;
        assert_eq!(replacement.receive_buffer, -1);
        assert!(replacement.dictionary.is_empty());
        assert_eq!(consumer.connections_accepted(), 2);
    }

    #[tokio::test]
    async fn aged_connections_rotate_on_put() {
        let consumer = MockConsumer::start(ConsumerOptions::default()).await.unwrap();
        let pool = StreamPool::new(1, pool_config(consumer.url(), Duration::from_millis(50)));

        let conn = pool.get().await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        pool.put(conn).await;

        let _ = pool.get().await;
        assert_eq!(consumer.connections_accepted(), 2);
    }

    #[tokio::test]
    async fn dial_retries_until_the_consumer_appears() {
        // Nothing is listening yet; the pool must keep trying.
        let placeholder = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = placeholder.local_addr().unwrap();
        drop(placeholder);

        let pool = StreamPool::new(
            1,
            pool_config(format!("ws://{addr}/ws/metrics/store"), Duration::ZERO),
        );

        // Nobody home: get() should still be waiting after a few retries.
        let get_times_out =
            tokio::time::timeout(Duration::from_millis(150), pool.get()).await;
        assert!(get_times_out.is_err());
    }
}
