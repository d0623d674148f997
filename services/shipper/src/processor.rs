//! The record processor: a single pass between the incoming and outgoing
//! channels.
//!
//! Today the policy step is an identity transform; the structure exists so
//! a rejection policy can be dropped in without touching the pipeline.  A
//! rejected record is still forwarded, error-flagged, so the publisher can
//! count it and segregate it from the main batch; records never silently
//! disappear between the two channels.

use ms_protocol::Record;
use tokio::sync::mpsc;
use tracing::debug;

pub struct Processor {
    incoming: mpsc::Receiver<Record>,
    outgoing: mpsc::Sender<Record>,
}

impl Processor {
    pub fn new(incoming: mpsc::Receiver<Record>, outgoing: mpsc::Sender<Record>) -> Self {
        Processor { incoming, outgoing }
    }

    /// Run until the incoming channel closes.  Dropping the outgoing sender
    /// on return is what propagates shutdown to the publishers.
    pub async fn run(mut self) {
        while let Some(mut record) = self.incoming.recv().await {
            match Self::process(&record) {
                Ok(()) => {}
                Err(reason) => {
                    debug!(metric = %record.metric, reason, "record failed processing");
                    record.error = true;
                }
            }
            if self.outgoing.send(record).await.is_err() {
                // Publishers are gone; the process is shutting down.
                return;
            }
        }
        debug!("incoming channel closed; processor exiting");
    }

    /// Policy hook.  Returns a static reason on rejection.
    fn process(_record: &Record) -> Result<(), &'static str> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(metric: &str, value: f64) -> Record {
        Record {
            timestamp: 1.0,
            metric: metric.to_owned(),
            value,
            ..Record::default()
        }
    }

    #[tokio::test]
    async fn forwards_in_fifo_order() {
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let handle = tokio::spawn(Processor::new(in_rx, out_tx).run());

        for i in 0..5 {
            in_tx.send(record(&format!("m{i}"), f64::from(i))).await.unwrap();
        }
        drop(in_tx);

        for i in 0..5 {
            let got = out_rx.recv().await.unwrap();
            assert_eq!(got.metric, format!("m{i}"));
            assert!(!got.error);
        }
        // Incoming closed -> processor exits and closes outgoing.
        assert!(out_rx.recv().await.is_none());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn stops_when_outgoing_is_dropped() {
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, out_rx) = mpsc::channel(8);
        drop(out_rx);
        let handle = tokio::spawn(Processor::new(in_rx, out_tx).run());

        in_tx.send(record("m", 1.0)).await.unwrap();
        handle.await.unwrap();
    }
}
