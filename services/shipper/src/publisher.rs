//! The adaptive shipper: assembles batches from the outgoing channel and
//! publishes them over pooled consumer connections.
//!
//! Flow control is credit-based.  The consumer advertises a record-count
//! credit in `BUFFER_UPDATE` frames; each batch is capped at
//! `min(max_batch_size, credit)`, and the credit is debited by records
//! sent.  At zero credit the shipper sends empty heartbeat batches (at
//! most every 100 ms) and blocks on the control read until credit
//! returns.  Collision frames feed the exponential backoff instead of the
//! batch size; the backoff wait runs at the top of every send attempt.
//!
//! Retry policy by failure class:
//! - transport-level send or read failure: the connection is closed (the
//!   pool replaces it) and the in-memory batch is re-sent on a fresh
//!   connection, which is safe because the consumer never consumed it;
//! - `DROPPED` / `ERROR` / `MALFORMED_REQUEST`: the batch is settled
//!   downstream and never re-sent.  `ERROR` additionally closes the
//!   connection; the pool reconnects.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use ms_protocol::{ControlFrame, ControlKind, Record, RecordBatch, encode_binary, encode_binary_snappy};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::{Compression, Encoding, ShipperConfig};
use crate::meter::Meter;
use crate::pool::{StreamConn, StreamPool};

/// Read deadline when draining whatever responses are already buffered.
const POLL_READ_DEADLINE: Duration = Duration::from_micros(10);
/// Read deadline when blocked waiting for credit.
const CREDIT_READ_DEADLINE: Duration = Duration::from_secs(10);
/// Floor between heartbeat polls at zero credit.
const CREDIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// Shared state for the shipper workers; `start` spawns one task each.
pub struct Publisher {
    outgoing: Arc<Mutex<mpsc::Receiver<Record>>>,
    pool: Arc<StreamPool>,
    encoding: Encoding,
    compression: Compression,
    max_batch_size: usize,
    batch_timeout: Duration,
    publish_error_metrics: bool,
    backoff_window_seconds: u64,
    max_backoff_steps: u32,
    max_backoff_delay_ms: u64,
    outgoing_records: Arc<Meter>,
    outgoing_bytes: Arc<Meter>,
    outgoing_errors: Arc<Meter>,
}

/// What happened to one send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendOutcome {
    /// Sent, and no fatal response arrived within the read deadline.
    Delivered,
    /// The batch is settled downstream (dropped, rejected, or failed
    /// server-side); never re-send it.
    Abandoned,
    /// The frame never reached the consumer; re-send on a fresh connection.
    Reconnect,
}

impl Publisher {
    pub fn new(
        config: &ShipperConfig,
        outgoing: mpsc::Receiver<Record>,
        pool: Arc<StreamPool>,
        outgoing_records: Arc<Meter>,
        outgoing_bytes: Arc<Meter>,
        outgoing_errors: Arc<Meter>,
    ) -> Arc<Publisher> {
        Arc::new(Publisher {
            outgoing: Arc::new(Mutex::new(outgoing)),
            pool,
            encoding: config.encoding,
            compression: config.compression,
            max_batch_size: config.max_batch_size,
            batch_timeout: Duration::from_secs_f64(config.batch_timeout_seconds),
            publish_error_metrics: config.publish_error_metrics,
            backoff_window_seconds: config.backoff_window_seconds,
            max_backoff_steps: config.max_backoff_steps,
            max_backoff_delay_ms: config.max_backoff_delay_ms,
            outgoing_records,
            outgoing_bytes,
            outgoing_errors,
        })
    }

    /// Spawn `writers` shipper workers.  Each runs until the outgoing
    /// channel closes and drains.
    pub fn start(self: &Arc<Self>, writers: usize) -> Vec<JoinHandle<()>> {
        (0..writers)
            .map(|worker| {
                let publisher = Arc::clone(self);
                tokio::spawn(publisher.run_shipper(worker))
            })
            .collect()
    }

    async fn run_shipper(self: Arc<Self>, worker: usize) {
        let backoff = Backoff::new(
            self.backoff_window_seconds,
            self.max_backoff_steps,
            self.max_backoff_delay_ms,
        );

        loop {
            let mut conn = self.pool.get().await;

            // Zero credit: heartbeat until the consumer re-opens the window.
            if conn.receive_buffer == 0 {
                self.await_credit(&mut conn, &backoff).await;
                if conn.is_closed() || conn.receive_buffer == 0 {
                    self.pool.put(conn).await;
                    continue;
                }
            }

            let target = self.batch_target(&conn);
            let (records, channel_closed) = self.get_batch(target).await;

            if !records.is_empty() {
                let (main, errored): (Vec<Record>, Vec<Record>) =
                    records.into_iter().partition(|r| !r.error);

                if !main.is_empty() {
                    conn = self.send_with_retry(conn, &main, &backoff).await;
                }
                if !errored.is_empty() {
                    self.outgoing_errors.mark(errored.len() as u64);
                    if self.publish_error_metrics {
                        conn = self.send_with_retry(conn, &errored, &backoff).await;
                    } else {
                        debug!(count = errored.len(), "dropping error-flagged records");
                    }
                }
            }

            self.pool.put(conn).await;
            if channel_closed {
                break;
            }
        }
        debug!(worker, "outgoing channel drained; shipper exiting");
    }

    /// Records per batch for this connection: the consumer's credit when it
    /// has advertised one, the configured maximum otherwise.
    fn batch_target(&self, conn: &StreamConn) -> usize {
        if conn.receive_buffer < 0 {
            self.max_batch_size
        } else {
            self.max_batch_size.min(conn.receive_buffer as usize)
        }
    }

    /// Pull records until `target` is reached or the batch timer fires.
    /// The boolean is true when the outgoing channel has closed.
    async fn get_batch(&self, target: usize) -> (Vec<Record>, bool) {
        let mut records = Vec::with_capacity(target);
        let timer = tokio::time::sleep(self.batch_timeout);
        tokio::pin!(timer);

        let mut outgoing = self.outgoing.lock().await;
        while records.len() < target {
            tokio::select! {
                () = &mut timer => break,
                next = outgoing.recv() => match next {
                    Some(record) => records.push(record),
                    None => return (records, true),
                },
            }
        }
        (records, false)
    }

    /// Send one batch, replacing the connection until an attempt settles.
    /// Always returns a connection (possibly a fresh borrow).
    async fn send_with_retry(
        &self,
        mut conn: StreamConn,
        records: &[Record],
        backoff: &Backoff,
    ) -> StreamConn {
        loop {
            // A connection flagged on an earlier attempt (or an earlier
            // batch this cycle) is swapped before anything else is sent.
            if conn.is_closed() {
                self.pool.put(conn).await;
                conn = self.pool.get().await;
            }
            backoff.wait().await;
            match self.send_batch(&mut conn, records, backoff).await {
                SendOutcome::Delivered => {
                    debug!(count = records.len(), "sent records to the consumer");
                    return conn;
                }
                SendOutcome::Abandoned => return conn,
                SendOutcome::Reconnect => {
                    error!(
                        count = records.len(),
                        "failed sending records to the consumer; reconnecting"
                    );
                }
            }
        }
    }

    /// One encode + send + response-drain attempt on one connection.
    async fn send_batch(
        &self,
        conn: &mut StreamConn,
        records: &[Record],
        backoff: &Backoff,
    ) -> SendOutcome {
        let batch = RecordBatch::new(records.to_vec());
        let frame = match self.encode(&batch, conn) {
            Ok(frame) => frame,
            Err(e) => {
                // Nothing about a fresh connection fixes an encoding
                // failure; abandoning beats a hot retry loop.
                error!(error = %e, "unable to encode batch");
                return SendOutcome::Abandoned;
            }
        };
        let frame_bytes = frame.len() as u64;

        if let Err(e) = conn.ws.send(frame_to_message(self.encoding, frame)).await {
            warn!(error = %e, "send to consumer failed");
            conn.mark_closed();
            return SendOutcome::Reconnect;
        }

        let outcome = self
            .read_responses(conn, POLL_READ_DEADLINE, backoff, false)
            .await;

        if outcome == SendOutcome::Delivered {
            if conn.receive_buffer > 0 {
                conn.receive_buffer = (conn.receive_buffer - records.len() as i64).max(0);
            }
            self.outgoing_records.mark(records.len() as u64);
            self.outgoing_bytes.mark(frame_bytes);
        }
        outcome
    }

    fn encode(
        &self,
        batch: &RecordBatch,
        conn: &StreamConn,
    ) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
        match (self.encoding, self.compression) {
            (Encoding::Json, _) => Ok(batch.to_json()?.into_bytes()),
            (Encoding::Binary, Compression::None) => {
                Ok(encode_binary(batch, &conn.dictionary)?)
            }
            (Encoding::Binary, Compression::Snappy) => {
                Ok(encode_binary_snappy(batch, &conn.dictionary)?)
            }
        }
    }

    /// Read control frames until the deadline lapses or a frame settles the
    /// batch's fate.  The deadline is a few microseconds on the normal path
    /// (drain whatever the consumer already pushed) and several seconds
    /// when blocked on credit; `stop_on_credit` makes a `BUFFER_UPDATE`
    /// end the read early so the credit loop can react.
    async fn read_responses(
        &self,
        conn: &mut StreamConn,
        deadline: Duration,
        backoff: &Backoff,
        stop_on_credit: bool,
    ) -> SendOutcome {
        let deadline_at = tokio::time::Instant::now() + deadline;
        loop {
            let remaining = deadline_at.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return SendOutcome::Delivered;
            }
            let next = match tokio::time::timeout(remaining, conn.ws.next()).await {
                Err(_elapsed) => return SendOutcome::Delivered,
                Ok(None) => {
                    warn!("consumer closed the connection");
                    conn.mark_closed();
                    return SendOutcome::Reconnect;
                }
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "error reading from consumer");
                    conn.mark_closed();
                    return SendOutcome::Reconnect;
                }
                Ok(Some(Ok(message))) => message,
            };

            let text = match next {
                Message::Text(text) => text,
                Message::Ping(payload) => {
                    let _ = conn.ws.send(Message::Pong(payload)).await;
                    continue;
                }
                Message::Close(_) => {
                    conn.mark_closed();
                    return SendOutcome::Reconnect;
                }
                _ => continue,
            };

            let frame = match ControlFrame::parse(&text) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "malformed control frame from consumer");
                    continue;
                }
            };

            match frame.classify() {
                ControlKind::Ok | ControlKind::DataReceived | ControlKind::Pong => {}
                ControlKind::BufferUpdate(credit) => {
                    debug!(credit, "consumer advertised receive buffer");
                    // A non-positive advertisement closes the window; it is
                    // distinct from the "never advertised" initial state.
                    conn.receive_buffer = credit.max(0);
                    if stop_on_credit {
                        return SendOutcome::Delivered;
                    }
                }
                ControlKind::Collision => {
                    debug!(frame_type = %frame.frame_type, "consumer reported a collision");
                    backoff.collision();
                }
                ControlKind::Dropped => {
                    backoff.collision();
                    error!("consumer dropped the batch; records are not retried");
                    return SendOutcome::Abandoned;
                }
                ControlKind::ServerError => {
                    // The pool reconnects, but the batch is not re-sent:
                    // only transport failures warrant a retry.
                    error!("consumer reported a server error; closing connection");
                    conn.mark_closed();
                    return SendOutcome::Abandoned;
                }
                ControlKind::MalformedRequest => {
                    error!("consumer rejected the batch as malformed");
                    return SendOutcome::Abandoned;
                }
                ControlKind::Invalid | ControlKind::Unknown => {
                    warn!(frame_type = %frame.frame_type, "ignoring unhandled control frame");
                }
            }
        }
    }

    /// At zero credit: send empty heartbeat batches and block on the
    /// response until the consumer advertises credit again, polling at
    /// most every 100 ms.  Leaves the connection marked closed on
    /// transport failure.
    async fn await_credit(&self, conn: &mut StreamConn, backoff: &Backoff) {
        info!("consumer receive buffer exhausted; waiting for credit");
        while conn.receive_buffer == 0 && !conn.is_closed() {
            let heartbeat = RecordBatch::new(Vec::new());
            let frame = match self.encode(&heartbeat, conn) {
                Ok(frame) => frame,
                Err(e) => {
                    error!(error = %e, "unable to encode heartbeat batch");
                    return;
                }
            };
            if let Err(e) = conn.ws.send(frame_to_message(self.encoding, frame)).await {
                warn!(error = %e, "heartbeat send failed");
                conn.mark_closed();
                return;
            }
            match self
                .read_responses(conn, CREDIT_READ_DEADLINE, backoff, true)
                .await
            {
                SendOutcome::Delivered | SendOutcome::Abandoned => {}
                SendOutcome::Reconnect => return,
            }
            if conn.receive_buffer == 0 {
                tokio::time::sleep(CREDIT_POLL_INTERVAL).await;
            }
        }
        if conn.receive_buffer != 0 {
            info!(credit = conn.receive_buffer, "consumer credit restored");
        }
    }
}

fn frame_to_message(encoding: Encoding, frame: Vec<u8>) -> Message {
    match encoding {
        Encoding::Json => Message::Text(
            String::from_utf8(frame)
                .expect("JSON encoding always produces UTF-8")
                .into(),
        ),
        Encoding::Binary => Message::Binary(frame.into()),
    }
}
