//! `twinview probe`: live connectivity test over the duplex channel

use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::state::RunContext;
use crate::transport::{connect_with_retry, ChannelConfig, DuplexChannel, Received};
use crate::wire::encode;

/// Wait between connect attempts while the peer is down
pub const CONNECT_BACKOFF: Duration = Duration::from_secs(3);
const SEND_INTERVAL: Duration = Duration::from_secs(1);
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Image part of probe messages
pub const PROBE_PAYLOAD: &[u8] = b"twinview-probe";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeReport {
    pub sent: u64,
    pub received: u64,
    pub errors: u64,
}

impl ProbeReport {
    pub fn passed(&self) -> bool {
        self.received > 0
    }
}

/// Wait for the peer, then exchange probe messages for `duration`
///
/// Returns `Ok(None)` when the run context stopped before the peer
/// became reachable.
pub async fn run_probe(
    config: &ChannelConfig,
    duration: Duration,
    ctx: &RunContext,
) -> Result<Option<ProbeReport>> {
    info!("Waiting for peer at {}", config.remote);
    if connect_with_retry(&config.remote, CONNECT_BACKOFF, ctx)
        .await
        .is_none()
    {
        return Ok(None);
    }

    let mut channel = DuplexChannel::open(config).map_err(AppError::from)?;
    info!(
        "Probing {} for {:?} (publishing on {})",
        config.remote,
        duration,
        channel.publisher().local_addr()
    );

    let mut report = ProbeReport::default();
    let start = Instant::now();
    let mut next_send = start;
    let mut next_report = start + REPORT_INTERVAL;

    while ctx.should_run() && start.elapsed() < duration {
        let now = Instant::now();
        if now >= next_send {
            let parts = encode(0, Bytes::from_static(PROBE_PAYLOAD))?;
            channel.publish(parts);
            report.sent += 1;
            next_send = now + SEND_INTERVAL;
        }
        if now >= next_report {
            info!(
                "Probe: sent={} received={} errors={} connected={}",
                report.sent,
                report.received,
                report.errors,
                channel.is_connected()
            );
            next_report = now + REPORT_INTERVAL;
        }

        let wait = next_send
            .saturating_duration_since(Instant::now())
            .max(Duration::from_millis(10));
        match channel.try_receive(wait).await {
            Received::Message(m) => {
                report.received += 1;
                debug!(
                    "Probe message: {} bytes, {} people, {:.3}s old",
                    m.image.len(),
                    m.metadata.people_count,
                    m.metadata.age_secs()
                );
            }
            Received::Timeout => {}
            Received::Error(e) => {
                report.errors += 1;
                warn!("Probe receive error: {}", e);
            }
        }
    }

    Ok(Some(report))
}
