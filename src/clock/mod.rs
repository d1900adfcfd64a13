//! Clock - Wall Clock With External Time Sync
//!
//! ## Responsibilities
//!
//! - Provide the wall-clock instant capture sessions are scheduled against
//! - Estimate the local offset against SNTP servers
//! - Carry the assumed maximum inter-node clock skew
//!
//! Capture accuracy rests on every node running its own clock sync service
//! (chrony/ntpd). The coordinator only needs its own clock to agree with the
//! nodes to within `max_skew`; it cannot verify the nodes' clocks.

use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Local, Utc};
use rsntp::AsyncSntpClient;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Source of the coordinator's notion of "now"
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Assumed worst-case skew between this clock and any node clock
    fn max_skew(&self) -> Duration;
}

/// Plain system clock, trusted as already synchronized
#[derive(Debug, Clone)]
pub struct SystemClock {
    max_skew: Duration,
}

impl SystemClock {
    pub fn new(max_skew: Duration) -> Self {
        Self { max_skew }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new(Duration::milliseconds(50))
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn max_skew(&self) -> Duration {
        self.max_skew
    }
}

/// Result of one successful SNTP exchange
#[derive(Debug, Clone)]
pub struct SyncSample {
    pub server: String,
    pub offset: Duration,
    pub round_trip: Duration,
}

/// System clock corrected by an SNTP-measured offset
pub struct SyncedClock {
    servers: Vec<String>,
    max_skew: Duration,
    offset_ms: AtomicI64,
    last_sync: RwLock<Option<DateTime<Utc>>>,
    query_timeout: std::time::Duration,
}

impl SyncedClock {
    pub fn new(servers: Vec<String>, max_skew: Duration) -> Self {
        Self {
            servers,
            max_skew,
            offset_ms: AtomicI64::new(0),
            last_sync: RwLock::new(None),
            query_timeout: std::time::Duration::from_secs(5),
        }
    }

    /// Current offset applied to the system clock
    pub fn offset(&self) -> Duration {
        Duration::milliseconds(self.offset_ms.load(Ordering::Relaxed))
    }

    /// True if a sync succeeded within `max_age`
    pub async fn is_synchronized(&self, max_age: Duration) -> bool {
        match *self.last_sync.read().await {
            Some(at) => Utc::now() - at < max_age,
            None => false,
        }
    }

    /// Try each server in order until one answers
    pub async fn sync(&self) -> Result<SyncSample> {
        for server in &self.servers {
            match query_sntp(server, self.query_timeout).await {
                Ok(sample) => {
                    self.offset_ms
                        .store(sample.offset.num_milliseconds(), Ordering::Relaxed);
                    *self.last_sync.write().await = Some(Utc::now());
                    tracing::info!(
                        server = %sample.server,
                        offset_ms = sample.offset.num_milliseconds(),
                        round_trip_ms = sample.round_trip.num_milliseconds(),
                        "Clock synchronized"
                    );
                    return Ok(sample);
                }
                Err(e) => {
                    tracing::warn!(server = %server, error = %e, "SNTP server failed");
                }
            }
        }

        tracing::error!("All SNTP servers failed, keeping previous offset");
        Err(Error::Network("no SNTP server answered".to_string()))
    }

    /// Periodic resync in the background
    pub fn start(self: Arc<Self>, interval: std::time::Duration) {
        tokio::spawn(async move {
            loop {
                let _ = self.sync().await;
                tokio::time::sleep(interval).await;
            }
        });
    }
}

impl Clock for SyncedClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.offset()
    }

    fn max_skew(&self) -> Duration {
        self.max_skew
    }
}

/// One SNTP exchange with `server` (host or host:port)
async fn query_sntp(server: &str, timeout: std::time::Duration) -> Result<SyncSample> {
    let mut client = AsyncSntpClient::new();
    client.set_timeout(timeout);

    let result = client
        .synchronize(server)
        .await
        .map_err(|e| Error::Network(format!("SNTP {}: {}", server, e)))?;

    Ok(SyncSample {
        server: server.to_string(),
        offset: seconds_to_duration(result.clock_offset().as_secs_f64()),
        round_trip: seconds_to_duration(result.round_trip_delay().as_secs_f64()),
    })
}

/// Signed fractional seconds, rounded to milliseconds
fn seconds_to_duration(secs: f64) -> Duration {
    Duration::milliseconds((secs * 1000.0).round() as i64)
}

/// Display format used in `capture_time_formatted`
pub fn format_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S%.3f")
        .to_string()
}

/// Unix seconds with sub-second precision, as sent to nodes
pub fn to_epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}
