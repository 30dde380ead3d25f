//! Subscribe endpoint with background reconnect

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, trace};

use super::TransportError;
use crate::wire::MultipartCodec;

type Delivery = Result<Vec<Bytes>, TransportError>;

/// Subscriber tuning
#[derive(Debug, Clone)]
pub struct SubscriberOptions {
    /// Messages held for the reader before new ones are dropped
    pub queue: usize,
    /// First reconnect delay
    pub reconnect_interval: Duration,
    /// Reconnect delay cap (the delay doubles up to this)
    pub reconnect_interval_max: Duration,
}

impl Default for SubscriberOptions {
    fn default() -> Self {
        Self {
            queue: 8,
            reconnect_interval: Duration::from_millis(100),
            reconnect_interval_max: Duration::from_secs(1),
        }
    }
}

/// Subscribe endpoint connected to one remote publisher
///
/// Creation never blocks: a background task connects, reads frames and
/// reconnects with backoff whenever the connection drops. Connect
/// failures are silent; a dead peer shows up as receive timeouts.
pub struct Subscriber {
    remote: String,
    rx: mpsc::Receiver<Delivery>,
    connected: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Subscriber {
    pub fn connect(remote: impl Into<String>, options: SubscriberOptions) -> Self {
        let remote = remote.into();
        let (tx, rx) = mpsc::channel(options.queue.max(1));
        let connected = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(read_loop(
            remote.clone(),
            options,
            tx,
            connected.clone(),
        ));
        debug!("Subscriber started for {}", remote);
        Self {
            remote,
            rx,
            connected,
            task,
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Whether a TCP connection to the remote is currently up
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Wait up to `timeout` for the next delivery; `None` on timeout
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Delivery> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(delivery)) => Some(delivery),
            Ok(None) => Some(Err(TransportError::Closed)),
            Err(_) => None,
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn read_loop(
    remote: String,
    options: SubscriberOptions,
    tx: mpsc::Sender<Delivery>,
    connected: Arc<AtomicBool>,
) {
    let mut backoff = options.reconnect_interval;
    while !tx.is_closed() {
        let stream = match TcpStream::connect(&remote).await {
            Ok(stream) => stream,
            Err(e) => {
                trace!("Connect to {} failed: {}", remote, e);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(options.reconnect_interval_max);
                continue;
            }
        };

        info!("Subscribed to {}", remote);
        backoff = options.reconnect_interval;
        let _ = stream.set_nodelay(true);
        connected.store(true, Ordering::Relaxed);

        let mut frames = FramedRead::new(stream, MultipartCodec::new());
        let reason = loop {
            match frames.next().await {
                Some(Ok(parts)) => {
                    if !deliver(&tx, Ok(parts)) {
                        return;
                    }
                }
                Some(Err(e)) => {
                    // Stream position is lost after a framing error
                    let reason = e.to_string();
                    deliver(&tx, Err(TransportError::Framing(e)));
                    break reason;
                }
                None => break "closed by peer".to_string(),
            }
        };

        connected.store(false, Ordering::Relaxed);
        info!("Connection to {} lost: {}", remote, reason);
        deliver(
            &tx,
            Err(TransportError::Disconnected {
                remote: remote.clone(),
                reason,
            }),
        );
        tokio::time::sleep(backoff).await;
    }
}

/// Push without blocking; returns `false` once the reader is gone
fn deliver(tx: &mpsc::Sender<Delivery>, delivery: Delivery) -> bool {
    match tx.try_send(delivery) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            trace!("Receive queue full, dropping message");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_times_out_when_peer_absent() {
        // Reserve a port and release it so nothing listens there
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut subscriber =
            Subscriber::connect(format!("127.0.0.1:{}", port), SubscriberOptions::default());

        let started = std::time::Instant::now();
        assert!(subscriber
            .recv_timeout(Duration::from_millis(200))
            .await
            .is_none());
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(!subscriber.is_connected());
    }
}
