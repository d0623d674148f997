//! The queue drainer: claims serialized records off the upstream list and
//! feeds the incoming channel.
//!
//! Each claim is one transactional round-trip (`LRANGE 0 n-1` plus
//! `LTRIM n -1` inside MULTI/EXEC), so claimed records are removed from the
//! source atomically and unclaimed records stay put.  Delivery is
//! at-most-once: a crash after the claim loses the in-flight records, by
//! design; durability lives in the upstream queue.
//!
//! The send into the incoming channel blocks when the pipeline is full.
//! That is the upstream backpressure surface: slow publishers stall the
//! drainers, and records accumulate in the queue instead of in memory.

use std::sync::Arc;
use std::time::Duration;

use ms_protocol::Record;
use redis::aio::MultiplexedConnection;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, QueueConfig, ShipperConfig};
use crate::meter::Meter;

/// Seconds between polls once the queue has been drained dry.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Drains the configured queue into the incoming channel.
///
/// Cloneable; `subscribe` clones one instance per worker.
#[derive(Clone)]
pub struct QueueReader {
    queue: QueueConfig,
    batch_size: usize,
    concurrency: usize,
    retry_timeout: Duration,
    incoming: mpsc::Sender<Record>,
    incoming_meter: Arc<Meter>,
    shutdown: watch::Receiver<bool>,
}

impl QueueReader {
    pub fn new(
        config: &ShipperConfig,
        incoming: mpsc::Sender<Record>,
        incoming_meter: Arc<Meter>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<QueueReader, ConfigError> {
        let queue = QueueConfig::parse(&config.redis_url)?;
        info!(
            server = %queue.server_addr(),
            database = %queue.database,
            channel = %queue.channel,
            concurrency = config.readers,
            "connecting to queue"
        );
        Ok(QueueReader {
            queue,
            batch_size: config.max_batch_size,
            concurrency: config.readers,
            retry_timeout: Duration::from_secs(config.retry_connection_timeout_seconds),
            incoming,
            incoming_meter,
            shutdown,
        })
    }

    /// Spawn the drainer workers.  Each polls the queue once a second and
    /// drains it dry, forever, until the shutdown flag flips.
    pub fn subscribe(self) -> Vec<JoinHandle<()>> {
        (0..self.concurrency)
            .map(|worker| {
                let mut reader = self.clone();
                tokio::spawn(async move {
                    loop {
                        if *reader.shutdown.borrow() {
                            break;
                        }
                        reader.drain().await;
                        if *reader.shutdown.borrow() {
                            break;
                        }
                        tokio::select! {
                            () = tokio::time::sleep(POLL_INTERVAL) => {}
                            _ = reader.shutdown.changed() => {}
                        }
                    }
                    debug!(worker, "queue reader exiting");
                })
            })
            .collect()
    }

    /// Drain the queue until it reports empty.  Transport errors close the
    /// connection and re-dial; they never end the drain early.
    pub async fn drain(&mut self) {
        loop {
            let Some(mut conn) = self.connect().await else {
                return; // shutting down
            };
            loop {
                match self.read_batch(&mut conn).await {
                    Some(0) => return,
                    Some(_) => {}
                    None => break, // error on this connection; re-dial
                }
            }
        }
    }

    /// Claim up to `batch_size` records in one transaction and forward the
    /// valid ones.
    ///
    /// Returns the total element count (malformed included), or `None` on a
    /// transport error.  A malformed element is logged and skipped; it
    /// counts toward the total but not toward the incoming meter.
    pub async fn read_batch(&self, conn: &mut MultiplexedConnection) -> Option<usize> {
        let claim = redis::pipe()
            .atomic()
            .cmd("LRANGE")
            .arg(&self.queue.channel)
            .arg(0)
            .arg(self.batch_size as i64 - 1)
            .cmd("LTRIM")
            .arg(&self.queue.channel)
            .arg(self.batch_size as i64)
            .arg(-1)
            .query_async::<(Vec<Vec<u8>>, redis::Value)>(conn)
            .await;

        let (elements, _trim_ok) = match claim {
            Ok(reply) => reply,
            Err(e) => {
                error!(error = %e, "error claiming records from the queue");
                return None;
            }
        };

        let total = elements.len();
        let mut valid = 0u64;
        for raw in elements {
            match Record::from_json(&raw) {
                Ok(record) => {
                    if self.incoming.send(record).await.is_err() {
                        // The processor is gone; stop claiming.
                        return Some(0);
                    }
                    valid += 1;
                }
                Err(e) => {
                    warn!(error = %e, "skipping invalid record from the queue");
                }
            }
        }
        self.incoming_meter.mark(valid);
        Some(total)
    }

    /// Dial the queue, retrying until it works or shutdown is signalled.
    /// Issues `SELECT` for the configured database on every new connection.
    async fn connect(&mut self) -> Option<MultiplexedConnection> {
        loop {
            if *self.shutdown.borrow() {
                return None;
            }
            match self.dial().await {
                Ok(conn) => return Some(conn),
                Err(e) => {
                    warn!(
                        server = %self.queue.server_addr(),
                        error = %e,
                        "unable to connect to the queue; retrying"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(self.retry_timeout) => {}
                        _ = self.shutdown.changed() => {}
                    }
                }
            }
        }
    }

    /// One dial attempt: connect and `SELECT` the configured database.
    pub async fn dial(&self) -> Result<MultiplexedConnection, redis::RedisError> {
        let client = redis::Client::open(format!("redis://{}/", self.queue.server_addr()))?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        redis::cmd("SELECT")
            .arg(&self.queue.database)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(conn)
    }
}
