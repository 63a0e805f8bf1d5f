//! Metered publication of step snapshots
//!
//! Each step handler runs one meter task that owns the step's annotation
//! stream. Snapshots arrive over a channel; the meter always writes the first
//! one immediately, then coalesces bursts so at most one datagram is written
//! per interval, and flushes the latest pending snapshot when the channel
//! closes.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use crate::stream::{OutputStream, StreamName};

/// How often snapshot updates are written to a step's annotation stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeterPolicy {
    /// Write every snapshot as soon as it arrives
    Immediate,
    /// Write at most once per interval
    Interval(#[serde(with = "humantime_serde")] Duration),
    /// Write only the first snapshot and the final one
    EndpointsOnly,
}

impl MeterPolicy {
    /// `None` meters only the endpoints, zero disables metering
    pub fn from_interval(interval: Option<Duration>) -> Self {
        match interval {
            None => Self::EndpointsOnly,
            Some(d) if d.is_zero() => Self::Immediate,
            Some(d) => Self::Interval(d),
        }
    }
}

impl Default for MeterPolicy {
    fn default() -> Self {
        Self::Interval(Duration::from_secs(5))
    }
}

/// Run the meter until `updates` is closed, then return the stream so the
/// owner can close it.
pub async fn run_meter(
    mut stream: Box<dyn OutputStream>,
    mut updates: mpsc::Receiver<Vec<u8>>,
    policy: MeterPolicy,
    step: StreamName,
) -> Box<dyn OutputStream> {
    let mut latest: Option<Vec<u8>> = None;
    let timer = time::sleep(Duration::ZERO);
    tokio::pin!(timer);
    let mut timer_running = false;
    let mut first = true;

    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(data) = update else {
                    break;
                };
                latest = Some(data);
                if first {
                    first = false;
                    send_latest(stream.as_mut(), &mut latest, &step).await;
                    continue;
                }
                match policy {
                    MeterPolicy::Immediate => {
                        send_latest(stream.as_mut(), &mut latest, &step).await;
                    }
                    MeterPolicy::Interval(interval) if !timer_running => {
                        timer.as_mut().reset(Instant::now() + interval);
                        timer_running = true;
                    }
                    MeterPolicy::Interval(_) | MeterPolicy::EndpointsOnly => {}
                }
            }
            () = &mut timer, if timer_running => {
                timer_running = false;
                send_latest(stream.as_mut(), &mut latest, &step).await;
            }
        }
    }

    send_latest(stream.as_mut(), &mut latest, &step).await;
    stream
}

async fn send_latest(stream: &mut dyn OutputStream, latest: &mut Option<Vec<u8>>, step: &StreamName) {
    let Some(data) = latest.take() else {
        return;
    };
    if let Err(e) = stream.write_datagram(&data).await {
        tracing::error!(step = %step, error = %e, "Failed to write annotation");
    }
}
