//! Self-telemetry: periodically turns the internal meters into records and
//! feeds them back through the pipeline.
//!
//! Injected records re-enter the incoming channel like any collector's
//! records, but they bypass the incoming meter and carry an `internal` tag,
//! so the stats → pipeline → meter cycle stays bounded by the fixed record
//! count per interval.  The same set is optionally POSTed as JSON to a
//! sideband URL (`CONTROLPLANE_CONSUMER_URL`).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ms_protocol::Record;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::ShipperConfig;
use crate::meter::{Meter, MeterSnapshot};

/// Tag marking a record as shipper self-telemetry.
pub const INTERNAL_TAG: &str = "internal";

pub struct StatsReporter {
    incoming: mpsc::Sender<Record>,
    incoming_meter: Arc<Meter>,
    outgoing_records: Arc<Meter>,
    outgoing_bytes: Arc<Meter>,
    interval: Duration,
    sideband_url: Option<String>,
    http: reqwest::Client,
    host: String,
    shutdown: watch::Receiver<bool>,
}

impl StatsReporter {
    pub fn new(
        config: &ShipperConfig,
        incoming: mpsc::Sender<Record>,
        incoming_meter: Arc<Meter>,
        outgoing_records: Arc<Meter>,
        outgoing_bytes: Arc<Meter>,
        shutdown: watch::Receiver<bool>,
    ) -> StatsReporter {
        let sideband_url = std::env::var("CONTROLPLANE_CONSUMER_URL")
            .ok()
            .filter(|url| !url.is_empty());
        if let Some(url) = &sideband_url {
            info!(url = %url, "stats sideband enabled");
        }
        StatsReporter {
            incoming,
            incoming_meter,
            outgoing_records,
            outgoing_bytes,
            interval: Duration::from_secs(config.stats_interval_seconds),
            sideband_url,
            http: reqwest::Client::new(),
            host: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "localhost".to_owned()),
            shutdown,
        }
    }

    /// Emit stats every interval until shutdown.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                () = tokio::time::sleep(self.interval) => {}
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        debug!("stats reporter exiting");
                        return;
                    }
                }
            }
            self.publish().await;
        }
    }

    /// Snapshot the meters, inject the records, POST the sideband copy.
    pub async fn publish(&self) {
        let now = chrono::Utc::now().timestamp() as f64;
        let mut records = Vec::new();
        for (infix, meter) in [
            ("totalIncoming", &self.incoming_meter),
            ("totalOutgoing", &self.outgoing_records),
            ("totalOutgoingBytes", &self.outgoing_bytes),
        ] {
            records.extend(meter_records(infix, meter.snapshot(), now, &self.host));
        }

        for record in &records {
            // A full pipe drops self-telemetry rather than deadlocking the
            // loop against its own backpressure.
            if let Err(e) = self.incoming.try_send(record.clone()) {
                debug!(error = %e, "incoming channel full; dropping self-telemetry record");
            }
        }

        if let Some(url) = &self.sideband_url {
            let body = serde_json::json!({ "metrics": records });
            match self.http.post(url).json(&body).send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    warn!(status = %response.status(), "stats sideband POST rejected");
                }
                Err(e) => {
                    warn!(error = %e, "stats sideband POST failed");
                }
            }
        }
    }
}

/// Expand one meter snapshot into its five stat records.
pub fn meter_records(infix: &str, snapshot: MeterSnapshot, now: f64, host: &str) -> Vec<Record> {
    let prefix = format!("metricshipper.{infix}");
    let stats = [
        ("count", snapshot.count as f64),
        ("meanRate", snapshot.mean_rate),
        ("1MinuteRate", snapshot.one_minute_rate),
        ("5MinuteRate", snapshot.five_minute_rate),
        ("15MinuteRate", snapshot.fifteen_minute_rate),
    ];
    stats
        .into_iter()
        .map(|(stat, value)| Record {
            timestamp: now,
            metric: format!("{prefix}.{stat}"),
            value,
            tags: BTreeMap::from([
                ("host".to_owned(), host.to_owned()),
                (INTERNAL_TAG.to_owned(), "metricshipper".to_owned()),
            ]),
            error: false,
        })
        .collect()
}
