//! Scenario 4 (spec §8): a session that reports three consecutive
//! connection-reset errors causes exactly one factory invocation, and the
//! supervisor resumes with an updated `last_successful_read`.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use warp_noize::error::ConnectError;
use warp_noize::supervisor::{NetstackIo, SessionFactory, Supervisor, TunnelSession};

struct FailThreeThenOk {
    remaining_failures: AtomicUsize,
}

#[async_trait]
impl TunnelSession for FailThreeThenOk {
    async fn write_packet(&self, _pkt: &[u8]) -> Result<Option<Vec<u8>>, ConnectError> {
        if self.remaining_failures.load(Ordering::SeqCst) > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
            Err(ConnectError::ConnectionError(
                "connection reset by peer".to_string(),
            ))
        } else {
            Ok(None)
        }
    }

    async fn read_packet(&self) -> Option<Vec<u8>> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        None
    }

    async fn close(&self) {}
}

struct RecordingSession {
    writes: AtomicUsize,
}

#[async_trait]
impl TunnelSession for RecordingSession {
    async fn write_packet(&self, _pkt: &[u8]) -> Result<Option<Vec<u8>>, ConnectError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }

    async fn read_packet(&self) -> Option<Vec<u8>> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        None
    }

    async fn close(&self) {}
}

struct ChannelNetstack {
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
}

#[async_trait]
impl NetstackIo for ChannelNetstack {
    async fn read_packet(&self) -> std::io::Result<Vec<u8>> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(pkt) => Ok(pkt),
            None => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!()
            }
        }
    }

    async fn write_packet(&self, _pkt: &[u8]) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn three_consecutive_connection_errors_trigger_exactly_one_recovery() {
    let (tx, rx) = mpsc::channel::<Vec<u8>>(8);
    let netstack: Arc<dyn NetstackIo> = Arc::new(ChannelNetstack { rx: Mutex::new(rx) });

    let initial: Arc<dyn TunnelSession> = Arc::new(FailThreeThenOk {
        remaining_failures: AtomicUsize::new(3),
    });

    let factory_calls = Arc::new(AtomicUsize::new(0));
    let factory_calls_clone = Arc::clone(&factory_calls);
    let factory: SessionFactory = Arc::new(move || {
        factory_calls_clone.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            let s: Arc<dyn TunnelSession> = Arc::new(RecordingSession {
                writes: AtomicUsize::new(0),
            });
            Ok(s)
        })
    });

    let supervisor = Supervisor::spawn(
        initial,
        netstack,
        factory,
        "https://example.com".to_string(),
    );

    for _ in 0..3 {
        tx.send(vec![0u8; 4]).await.unwrap();
    }

    // Recovery dials out to real anycast addresses and a test URL with an
    // 8s combined deadline; give it generous headroom in a sandboxed
    // environment with no outbound network access.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        if factory_calls.load(Ordering::SeqCst) >= 1 {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("recovery factory was never invoked within the deadline");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(factory_calls.load(Ordering::SeqCst), 1);
    assert!(!supervisor.is_broken());

    supervisor.shutdown().await;
}
