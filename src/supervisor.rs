//! Module F — the tunnel supervisor.
//!
//! Owns four cooperative forwarding/monitor tasks plus one recovery task
//! per MASQUE session (spec §4.F). The active session lives behind a
//! `RwLock`: forwarding tasks take read locks per packet, recovery takes
//! the write lock only for the swap.

use crate::error::ConnectError;
use crate::telemetry::{
    SUPERVISOR_CONNECTION_BROKEN, SUPERVISOR_GLOBAL_FAILURES, SUPERVISOR_LOCAL_FAILURES,
    SUPERVISOR_RECOVERIES,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;

/// Known Cloudflare anycast addresses used as a DNS-independent
/// reachability probe during recovery (spec §4.F.5).
const ANYCAST_PROBES: &[&str] = &[
    "1.1.1.1:443",
    "8.8.8.8:443",
    "104.16.132.229:443",
    "172.67.74.226:443",
    "104.21.2.20:443",
];

const STALE_LINK_INTERVAL: Duration = Duration::from_secs(45);
const STALE_LINK_THRESHOLD: Duration = Duration::from_secs(120);
const STALE_LINK_RECOVERY_GRACE: Duration = Duration::from_secs(60);
const FIREWALL_MONITOR_INTERVAL: Duration = Duration::from_secs(30);
const LOCAL_FAILURE_WINDOW: Duration = Duration::from_secs(120);
const GLOBAL_FAILURE_WINDOW: Duration = Duration::from_secs(180);
const LOCAL_FAILURE_THRESHOLD: u64 = 5;
const GLOBAL_FAILURE_THRESHOLD: u64 = 8;
const MAX_RECOVERY_ATTEMPTS: u32 = 5;
const MAX_RECOVERY_CYCLES_BEFORE_LONG_SLEEP: u32 = 3;

/// The netstack interface (external, out of scope): the supervisor only
/// needs to read and write whole IP packets.
#[async_trait]
pub trait NetstackIo: Send + Sync {
    async fn read_packet(&self) -> std::io::Result<Vec<u8>>;
    async fn write_packet(&self, pkt: &[u8]) -> std::io::Result<()>;
}

/// A live tunnel session: a duplex channel of raw IP packets. Implemented
/// by [`crate::masque::connect_ip::ConnectIpSession`] and by any external
/// WireGuard-direct adapter.
#[async_trait]
pub trait TunnelSession: Send + Sync {
    async fn write_packet(&self, pkt: &[u8]) -> Result<Option<Vec<u8>>, ConnectError>;
    async fn read_packet(&self) -> Option<Vec<u8>>;
    async fn close(&self);
}

#[async_trait]
impl TunnelSession for crate::masque::connect_ip::ConnectIpSession {
    async fn write_packet(&self, pkt: &[u8]) -> Result<Option<Vec<u8>>, ConnectError> {
        crate::masque::connect_ip::ConnectIpSession::write_packet(self, pkt).await
    }
    async fn read_packet(&self) -> Option<Vec<u8>> {
        crate::masque::connect_ip::ConnectIpSession::read_packet(self).await
    }
    async fn close(&self) {
        crate::masque::connect_ip::ConnectIpSession::close(self).await
    }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Builds a fresh session on demand: a fresh handshake and a fresh noize
/// wrapper every call. Captures the original endpoint, config path, and
/// noize config, per spec §4.F ("adapter factory... callable repeatedly").
pub type SessionFactory =
    Arc<dyn Fn() -> BoxFuture<Result<Arc<dyn TunnelSession>, ConnectError>> + Send + Sync>;

/// Counts failures that fall inside a trailing time window, pruning events
/// older than the window on every mutation (spec §4.F.4: "local failures
/// >= 5 within 120 s", "global failures >= 8 within 180 s"). A count of zero
/// after the window elapses with no new failures falls out naturally, so
/// there's no separate quiescence-reset state to track.
struct WindowedFailureCounter {
    events: Mutex<VecDeque<Instant>>,
    window: Duration,
}

impl WindowedFailureCounter {
    fn new(window: Duration) -> Self {
        WindowedFailureCounter {
            events: Mutex::new(VecDeque::new()),
            window,
        }
    }

    fn prune(events: &mut VecDeque<Instant>, window: Duration, now: Instant) {
        while let Some(&front) = events.front() {
            if now.duration_since(front) > window {
                events.pop_front();
            } else {
                break;
            }
        }
    }

    async fn record(&self) {
        let now = Instant::now();
        let mut events = self.events.lock().await;
        events.push_back(now);
        Self::prune(&mut events, self.window, now);
    }

    /// Count of events still inside the window, as of now.
    async fn count(&self) -> u64 {
        let now = Instant::now();
        let mut events = self.events.lock().await;
        Self::prune(&mut events, self.window, now);
        events.len() as u64
    }

    async fn reset(&self) {
        self.events.lock().await.clear();
    }
}

/// Shared state across all of a supervisor's tasks.
struct SupervisorState {
    session: RwLock<Arc<dyn TunnelSession>>,
    connection_broken: AtomicBool,
    connection_down_pending: AtomicBool,
    connection_down_notify: Notify,
    local_failures: WindowedFailureCounter,
    global_failures: WindowedFailureCounter,
    last_successful_read: Mutex<Instant>,
    last_successful_write: Mutex<Instant>,
    last_recovery_completed: Mutex<Option<Instant>>,
    recovery_cycle: AtomicU64,
}

impl SupervisorState {
    fn raise_connection_down(&self) {
        // Coalesced: only the first-to-arrive signal wakes the recovery
        // task; later callers observe it's already pending and return.
        if !self.connection_down_pending.swap(true, Ordering::SeqCst) {
            self.connection_broken.store(true, Ordering::SeqCst);
            SUPERVISOR_CONNECTION_BROKEN.set(1);
            self.connection_down_notify.notify_one();
        }
    }
}

/// Owns the forwarding/monitor/recovery tasks for one tunnel. Dropping this
/// (after calling [`Supervisor::shutdown`]) cancels every task.
pub struct Supervisor {
    state: Arc<SupervisorState>,
    cancel: CancellationToken,
}

impl Supervisor {
    /// Starts all five tasks against an initial session. `factory` is used
    /// only by the recovery task, to rebuild a session from scratch.
    pub fn spawn(
        initial_session: Arc<dyn TunnelSession>,
        netstack: Arc<dyn NetstackIo>,
        factory: SessionFactory,
        test_url: String,
    ) -> Self {
        let now = Instant::now();
        let state = Arc::new(SupervisorState {
            session: RwLock::new(initial_session),
            connection_broken: AtomicBool::new(false),
            connection_down_pending: AtomicBool::new(false),
            connection_down_notify: Notify::new(),
            local_failures: WindowedFailureCounter::new(LOCAL_FAILURE_WINDOW),
            global_failures: WindowedFailureCounter::new(GLOBAL_FAILURE_WINDOW),
            last_successful_read: Mutex::new(now),
            last_successful_write: Mutex::new(now),
            last_recovery_completed: Mutex::new(None),
            recovery_cycle: AtomicU64::new(0),
        });
        let cancel = CancellationToken::new();

        tokio::spawn(netstack_to_tunnel(
            Arc::clone(&state),
            Arc::clone(&netstack),
            cancel.clone(),
        ));
        tokio::spawn(tunnel_to_netstack(
            Arc::clone(&state),
            Arc::clone(&netstack),
            cancel.clone(),
        ));
        tokio::spawn(stale_link_monitor(Arc::clone(&state), cancel.clone()));
        tokio::spawn(firewall_interference_monitor(
            Arc::clone(&state),
            cancel.clone(),
        ));
        tokio::spawn(recovery_task(
            Arc::clone(&state),
            factory,
            test_url,
            cancel.clone(),
        ));

        Supervisor { state, cancel }
    }

    /// True if the active session is currently marked broken.
    pub fn is_broken(&self) -> bool {
        self.state.connection_broken.load(Ordering::SeqCst)
    }

    /// Cancels all tasks. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let session = self.state.session.read().await;
        session.close().await;
    }
}

async fn netstack_to_tunnel(
    state: Arc<SupervisorState>,
    netstack: Arc<dyn NetstackIo>,
    cancel: CancellationToken,
) {
    let mut consecutive_connection_errors = 0u32;
    loop {
        let pkt = tokio::select! {
            _ = cancel.cancelled() => return,
            r = netstack.read_packet() => r,
        };
        let pkt = match pkt {
            Ok(p) => p,
            Err(e) => {
                log::debug!("netstack read failed: {e}");
                tokio::time::sleep(Duration::from_millis(20)).await;
                continue;
            }
        };

        let session = Arc::clone(&*state.session.read().await);
        match session.write_packet(&pkt).await {
            Ok(icmp) => {
                consecutive_connection_errors = 0;
                *state.last_successful_write.lock().await = Instant::now();
                if let Some(icmp_pkt) = icmp {
                    if let Err(e) = netstack.write_packet(&icmp_pkt).await {
                        log::debug!("netstack write (icmp piggyback) failed: {e}");
                    }
                }
            }
            Err(e) => {
                if e.is_connection_error() {
                    consecutive_connection_errors += 1;
                    state.local_failures.record().await;
                    state.global_failures.record().await;
                    SUPERVISOR_LOCAL_FAILURES.inc();
                    SUPERVISOR_GLOBAL_FAILURES.inc();
                    if consecutive_connection_errors >= 3 {
                        consecutive_connection_errors = 0;
                        state.raise_connection_down();
                    }
                } else if e.is_timeout() {
                    log::debug!("netstack->tunnel write timed out: {e}");
                    tokio::time::sleep(Duration::from_millis(20)).await;
                } else {
                    log::debug!("netstack->tunnel write failed: {e}");
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            }
        }
    }
}

async fn tunnel_to_netstack(
    state: Arc<SupervisorState>,
    netstack: Arc<dyn NetstackIo>,
    cancel: CancellationToken,
) {
    let mut timeout_count = 0u32;
    loop {
        let session = Arc::clone(&*state.session.read().await);
        let read_timeout = if timeout_count < 3 {
            Duration::from_millis(200)
        } else {
            Duration::from_millis((200u64 << (timeout_count - 2).min(6)).min(30_000))
        };

        let pkt = tokio::select! {
            _ = cancel.cancelled() => return,
            r = tokio::time::timeout(read_timeout, session.read_packet()) => r,
        };

        match pkt {
            Ok(Some(p)) => {
                timeout_count = 0;
                *state.last_successful_read.lock().await = Instant::now();
                if let Err(e) = netstack.write_packet(&p).await {
                    log::debug!("netstack write failed: {e}");
                }
            }
            Ok(None) => {
                // read side closed; treat like a timeout so the stale-link
                // monitor eventually raises connection-down.
                timeout_count += 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(_elapsed) => {
                timeout_count += 1;
            }
        }
    }
}

async fn stale_link_monitor(state: Arc<SupervisorState>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(STALE_LINK_INTERVAL) => {}
        }
        let recent_recovery = state
            .last_recovery_completed
            .lock()
            .await
            .map(|t| t.elapsed() < STALE_LINK_RECOVERY_GRACE)
            .unwrap_or(false);
        if recent_recovery {
            continue;
        }
        let read_stale = state.last_successful_read.lock().await.elapsed() >= STALE_LINK_THRESHOLD;
        let write_stale =
            state.last_successful_write.lock().await.elapsed() >= STALE_LINK_THRESHOLD;
        if read_stale && write_stale {
            state.raise_connection_down();
        }
    }
}

async fn firewall_interference_monitor(state: Arc<SupervisorState>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(FIREWALL_MONITOR_INTERVAL) => {}
        }
        let local = state.local_failures.count().await;
        let global = state.global_failures.count().await;
        if local >= LOCAL_FAILURE_THRESHOLD || global >= GLOBAL_FAILURE_THRESHOLD {
            state.raise_connection_down();
        }
    }
}

async fn recovery_task(
    state: Arc<SupervisorState>,
    factory: SessionFactory,
    test_url: String,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = state.connection_down_notify.notified() => {}
        }
        if !state.connection_down_pending.swap(false, Ordering::SeqCst) {
            continue;
        }

        let recovery_cycle = state.recovery_cycle.load(Ordering::SeqCst);
        let mut accepted = false;

        for attempt in 1u32..=MAX_RECOVERY_ATTEMPTS {
            if cancel.is_cancelled() {
                return;
            }
            let settle = Duration::from_secs(attempt.min(5) as u64);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(settle) => {}
            }

            match factory().await {
                Ok(new_session) => {
                    {
                        let mut guard = state.session.write().await;
                        let old = std::mem::replace(&mut *guard, new_session);
                        old.close().await;
                    }
                    *state.last_successful_read.lock().await = Instant::now();
                    *state.last_successful_write.lock().await = Instant::now();
                    tokio::time::sleep(Duration::from_secs(1)).await;

                    state.connection_broken.store(false, Ordering::SeqCst);
                    SUPERVISOR_CONNECTION_BROKEN.set(0);

                    let reachable = validate_recovery(&test_url).await;
                    if !reachable {
                        log::warn!(
                            "recovery attempt {attempt}: anycast and testUrl probes both failed, accepting tunnel anyway"
                        );
                    }

                    state.local_failures.reset().await;
                    state.global_failures.reset().await;
                    *state.last_recovery_completed.lock().await = Some(Instant::now());
                    SUPERVISOR_RECOVERIES.inc();
                    accepted = true;
                    break;
                }
                Err(e) => {
                    log::warn!("recovery attempt {attempt} failed to build a new session: {e}");
                    let jitter = Duration::from_millis(rand::random::<u64>() % 500);
                    let backoff = Duration::from_secs((attempt as u64) * 2) + jitter;
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        if !accepted {
            state.recovery_cycle.fetch_add(1, Ordering::SeqCst);
            let sleep_for = if recovery_cycle + 1 >= MAX_RECOVERY_CYCLES_BEFORE_LONG_SLEEP as u64 {
                Duration::from_secs(60)
            } else {
                Duration::from_secs((recovery_cycle + 1) * 5)
            };
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(sleep_for) => {}
            }
            state.raise_connection_down();
        } else {
            state.recovery_cycle.store(0, Ordering::SeqCst);
        }
    }
}

/// Validates a freshly-swapped session: ≥2 anycast TCP connects (or ≥1
/// "partial") within 8 s, falling back to an HTTP GET of `test_url` (spec
/// §4.F.5). Always returns a best-effort result; the caller accepts the
/// tunnel either way.
async fn validate_recovery(test_url: &str) -> bool {
    let deadline = Duration::from_secs(8);
    let mut successes = 0;
    let attempts: Vec<_> = ANYCAST_PROBES
        .iter()
        .map(|addr| probe_anycast(addr, deadline))
        .collect();
    for result in futures::future::join_all(attempts).await {
        if result {
            successes += 1;
        }
    }
    if successes >= 2 {
        return true;
    }
    if successes >= 1 {
        return true;
    }

    let Ok(client) = reqwest::Client::builder().timeout(deadline).build() else {
        return false;
    };
    matches!(client.get(test_url).send().await, Ok(resp) if resp.status().is_success())
}

async fn probe_anycast(addr: &str, timeout: Duration) -> bool {
    let Ok(sock_addr): Result<SocketAddr, _> = addr.parse() else {
        return false;
    };
    tokio::time::timeout(timeout, tokio::net::TcpStream::connect(sock_addr))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct NullSession {
        reads: AtomicUsize,
    }

    #[async_trait]
    impl TunnelSession for NullSession {
        async fn write_packet(&self, _pkt: &[u8]) -> Result<Option<Vec<u8>>, ConnectError> {
            Ok(None)
        }
        async fn read_packet(&self) -> Option<Vec<u8>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            None
        }
        async fn close(&self) {}
    }

    struct NullNetstack;

    #[async_trait]
    impl NetstackIo for NullNetstack {
        async fn read_packet(&self) -> std::io::Result<Vec<u8>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
        async fn write_packet(&self, _pkt: &[u8]) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn windowed_failure_counter_prunes_events_outside_window() {
        let counter = WindowedFailureCounter::new(Duration::from_millis(20));
        counter.record().await;
        assert_eq!(counter.count().await, 1);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(counter.count().await, 0);
    }

    #[tokio::test]
    async fn windowed_failure_counter_counts_only_events_inside_the_window() {
        let counter = WindowedFailureCounter::new(Duration::from_millis(50));
        counter.record().await;
        tokio::time::sleep(Duration::from_millis(70)).await;
        // this event's window has already elapsed for the first record, but
        // the counter should still report 1 (only the fresh event remains).
        counter.record().await;
        assert_eq!(counter.count().await, 1);
    }

    #[tokio::test]
    async fn connection_down_signal_coalesces() {
        let now = Instant::now();
        let state = SupervisorState {
            session: RwLock::new(Arc::new(NullSession {
                reads: AtomicUsize::new(0),
            })),
            connection_broken: AtomicBool::new(false),
            connection_down_pending: AtomicBool::new(false),
            connection_down_notify: Notify::new(),
            local_failures: WindowedFailureCounter::new(LOCAL_FAILURE_WINDOW),
            global_failures: WindowedFailureCounter::new(GLOBAL_FAILURE_WINDOW),
            last_successful_read: Mutex::new(now),
            last_successful_write: Mutex::new(now),
            last_recovery_completed: Mutex::new(None),
            recovery_cycle: AtomicU64::new(0),
        };
        state.raise_connection_down();
        state.raise_connection_down();
        assert!(state.connection_down_pending.load(Ordering::SeqCst));
        assert!(state.connection_broken.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn spawn_and_shutdown_is_idempotent() {
        let session: Arc<dyn TunnelSession> = Arc::new(NullSession {
            reads: AtomicUsize::new(0),
        });
        let netstack: Arc<dyn NetstackIo> = Arc::new(NullNetstack);
        let factory: SessionFactory = Arc::new(|| {
            Box::pin(async {
                let s: Arc<dyn TunnelSession> = Arc::new(NullSession {
                    reads: AtomicUsize::new(0),
                });
                Ok(s)
            })
        });
        let supervisor = Supervisor::spawn(session, netstack, factory, "https://example.com".to_string());
        assert!(!supervisor.is_broken());
        supervisor.shutdown().await;
        supervisor.shutdown().await;
    }
}
