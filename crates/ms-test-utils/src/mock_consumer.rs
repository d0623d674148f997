// mock_consumer: A mock ingestion consumer for testing the publisher.
//
// Accepts WebSocket connections, decodes JSON or binary data frames
// (hydrating a per-connection translation dictionary from frame deltas),
// tallies received records, and answers each data frame with a scripted
// control frame; `{"type":"OK"}` once the script runs dry.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use futures_util::{SinkExt, StreamExt};
use ms_protocol::{Record, RecordBatch, decode_binary, decode_binary_snappy};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::Message;

/// Knobs for a mock consumer instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsumerOptions {
    /// Binary frames arrive snappy-compressed.
    pub snappy: bool,
}

/// A mock ingestion consumer for integration testing.
///
/// Binds to port 0 (random) and exposes the actual bound port.  Each test
/// spins up its own isolated instance.
pub struct MockConsumer {
    addr: SocketAddr,
    state: Arc<ConsumerState>,
    /// Handle to the background accept loop; dropped with the server.
    _task: tokio::task::JoinHandle<()>,
}

/// Shared observable state, cloned into every connection handler.
pub struct ConsumerState {
    options: ConsumerOptions,
    records_received: AtomicU64,
    frames_received: AtomicU64,
    connections_accepted: AtomicUsize,
    batches: Mutex<Vec<RecordBatch>>,
    script: Mutex<VecDeque<String>>,
}

impl MockConsumer {
    /// Start the mock consumer on a random port.
    pub async fn start(options: ConsumerOptions) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(ConsumerState {
            options,
            records_received: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            connections_accepted: AtomicUsize::new(0),
            batches: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
        });

        let accept_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            Self::accept_loop(listener, accept_state).await;
        });

        Ok(MockConsumer {
            addr,
            state,
            _task: task,
        })
    }

    /// `ws://` URL of the consumer endpoint.
    pub fn url(&self) -> String {
        format!("ws://{}/ws/metrics/store", self.addr)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Enqueue a raw JSON control frame to answer an upcoming data frame.
    pub fn push_response(&self, json: &str) {
        self.state
            .script
            .lock()
            .expect("script lock")
            .push_back(json.to_owned());
    }

    /// Total records tallied across all connections and frames.
    pub fn total_records(&self) -> u64 {
        self.state.records_received.load(Ordering::SeqCst)
    }

    /// Total data frames received, heartbeat (empty) frames included.
    pub fn total_frames(&self) -> u64 {
        self.state.frames_received.load(Ordering::SeqCst)
    }

    /// Number of physical connections accepted since startup.
    pub fn connections_accepted(&self) -> usize {
        self.state.connections_accepted.load(Ordering::SeqCst)
    }

    /// Snapshot of every batch received so far, in arrival order.
    pub fn batches(&self) -> Vec<RecordBatch> {
        self.state.batches.lock().expect("batches lock").clone()
    }

    // -- internal --

    async fn accept_loop(listener: TcpListener, state: Arc<ConsumerState>) {
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    let conn_state = Arc::clone(&state);
                    conn_state
                        .connections_accepted
                        .fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        // In tests, connection errors are expected (e.g. the
                        // pool rotates a connection away). Swallow silently.
                        let _ = Self::handle_connection(stream, conn_state).await;
                    });
                }
                Err(_) => break,
            }
        }
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        state: Arc<ConsumerState>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut write, mut read) = ws_stream.split();

        // Per-connection translation dictionary, hydrated from frame deltas.
        let mut dictionary: HashMap<u32, String> = HashMap::new();

        while let Some(msg_result) = read.next().await {
            let msg = msg_result?;

            let batch = match msg {
                Message::Text(t) => parse_json_batch(&t)?,
                Message::Binary(b) => {
                    let (batch, deltas) = if state.options.snappy {
                        decode_binary_snappy(&b, &dictionary)?
                    } else {
                        decode_binary(&b, &dictionary)?
                    };
                    dictionary.extend(deltas);
                    batch
                }
                Message::Close(_) => break,
                Message::Ping(data) => {
                    write.send(Message::Pong(data)).await?;
                    continue;
                }
                _ => continue,
            };

            state.frames_received.fetch_add(1, Ordering::SeqCst);
            state
                .records_received
                .fetch_add(batch.metrics.len() as u64, Ordering::SeqCst);
            state.batches.lock().expect("batches lock").push(batch);

            let response = state
                .script
                .lock()
                .expect("script lock")
                .pop_front()
                .unwrap_or_else(|| r#"{"type":"OK"}"#.to_owned());
            write.send(Message::Text(response.into())).await?;
        }

        Ok(())
    }
}

/// Parse the JSON wire form `{"control":null,"metrics":[...]}`.
fn parse_json_batch(text: &str) -> Result<RecordBatch, Box<dyn std::error::Error + Send + Sync>> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let metrics = value
        .get("metrics")
        .and_then(|m| m.as_array())
        .ok_or("frame missing metrics array")?;

    let mut records = Vec::with_capacity(metrics.len());
    for metric in metrics {
        let bytes = serde_json::to_vec(metric)?;
        records.push(Record::from_json(&bytes)?);
    }
    Ok(RecordBatch::new(records))
}
