//! Bound publish endpoint fanning messages out to connected peers

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tracing::{debug, info, warn};

use super::TransportError;
use crate::utils::bind_tcp_listener;
use crate::wire::{MultipartCodec, MAX_PARTS, MAX_PART_LEN};

/// Publish endpoint
///
/// Bound once for the lifetime of the process. Every accepted connection
/// gets its own writer task fed from a broadcast channel; a connection
/// that cannot keep up lags and loses the oldest messages.
pub struct Publisher {
    tx: broadcast::Sender<Vec<Bytes>>,
    local_addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    accept_task: JoinHandle<()>,
}

impl Publisher {
    /// Bind `addr` and start accepting subscribers
    ///
    /// `queue` is the number of messages buffered per connection.
    pub fn bind(addr: SocketAddr, queue: usize) -> Result<Self, TransportError> {
        let listener =
            bind_tcp_listener(addr).map_err(|source| TransportError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { addr, source })?;

        let (tx, _rx) = broadcast::channel(queue.max(1));
        let connections = Arc::new(AtomicUsize::new(0));
        let accept_task = tokio::spawn(accept_loop(listener, tx.clone(), connections.clone()));

        info!("Publisher bound on {}", local_addr);
        Ok(Self {
            tx,
            local_addr,
            connections,
            accept_task,
        })
    }

    /// Queue a multipart message for every connected subscriber
    ///
    /// Returns `false` only when the message cannot be framed. Publishing
    /// with nobody connected succeeds and the message is dropped.
    pub fn publish(&self, parts: Vec<Bytes>) -> bool {
        if parts.len() > MAX_PARTS {
            warn!("Refusing to publish {} parts (limit {})", parts.len(), MAX_PARTS);
            return false;
        }
        if let Some(part) = parts.iter().find(|p| p.len() > MAX_PART_LEN) {
            warn!("Refusing to publish {} byte part (limit {})", part.len(), MAX_PART_LEN);
            return false;
        }
        // Err only means nobody is subscribed
        let _ = self.tx.send(parts);
        true
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Currently connected subscribers
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: broadcast::Sender<Vec<Bytes>>,
    connections: Arc<AtomicUsize>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!("Subscriber connected: {}", peer);
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                }
                let rx = tx.subscribe();
                let connections = connections.clone();
                connections.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(async move {
                    write_loop(stream, peer, rx).await;
                    connections.fetch_sub(1, Ordering::Relaxed);
                });
            }
            Err(e) => {
                warn!("Error accepting subscriber: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

async fn write_loop(stream: TcpStream, peer: SocketAddr, mut rx: broadcast::Receiver<Vec<Bytes>>) {
    let mut sink = FramedWrite::new(stream, MultipartCodec::new());
    loop {
        match rx.recv().await {
            Ok(parts) => {
                if let Err(e) = sink.send(parts).await {
                    info!("Subscriber {} disconnected: {}", peer, e);
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Subscriber {} lagging, dropped {} messages", peer, skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let publisher = Publisher::bind("127.0.0.1:0".parse().unwrap(), 4).unwrap();
        assert_ne!(publisher.local_addr().port(), 0);
        assert!(publisher.publish(vec![Bytes::from_static(b"meta"), Bytes::new()]));
        assert_eq!(publisher.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let publisher = Publisher::bind("127.0.0.1:0".parse().unwrap(), 4).unwrap();
        let parts = vec![Bytes::new(); MAX_PARTS + 1];
        assert!(!publisher.publish(parts));
    }

    #[tokio::test]
    async fn test_second_bind_fails() {
        let first = Publisher::bind("127.0.0.1:0".parse().unwrap(), 4).unwrap();
        let err = Publisher::bind(first.local_addr(), 4).err().unwrap();
        assert!(matches!(err, TransportError::Bind { .. }));
    }
}
