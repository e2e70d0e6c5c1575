//! Prometheus metrics exported by the transport and obfuscation engine.
//!
//! Exported metrics:
//! - `preflight_bursts_total`: WireGuard preflight bursts actually emitted.
//! - `preflight_suppressed_total`: Preflight bursts suppressed by the
//!   per-destination rate limit.
//! - `preflight_junk_packets_total`: Junk packets sent by the preflight bind.
//! - `masque_junk_packets_total`: Junk packets sent by the MASQUE noize
//!   UDP wrapper.
//! - `masque_fragments_total`: QUIC datagram fragments emitted.
//! - `capsules_read_total` / `capsules_written_total`: Connect-IP capsule
//!   counts by direction.
//! - `supervisor_local_failures_total` / `supervisor_global_failures_total`:
//!   Connection-error counts observed by the forwarding tasks.
//! - `supervisor_recoveries_total`: Completed recovery cycles.
//! - `supervisor_connection_broken`: Current value of `connection_broken`.

use prometheus::{
    register_int_counter, register_int_gauge, Encoder, IntCounter, IntGauge, TextEncoder,
};

lazy_static::lazy_static! {
    pub static ref PREFLIGHT_BURSTS: IntCounter =
        register_int_counter!("preflight_bursts_total", "WireGuard preflight bursts emitted").unwrap();
    pub static ref PREFLIGHT_SUPPRESSED: IntCounter = register_int_counter!(
        "preflight_suppressed_total",
        "Preflight bursts suppressed by the rate limiter"
    )
    .unwrap();
    pub static ref PREFLIGHT_JUNK_PACKETS: IntCounter = register_int_counter!(
        "preflight_junk_packets_total",
        "Junk packets sent by the preflight bind"
    )
    .unwrap();
    pub static ref MASQUE_JUNK_PACKETS: IntCounter = register_int_counter!(
        "masque_junk_packets_total",
        "Junk packets sent by the MASQUE noize UDP wrapper"
    )
    .unwrap();
    pub static ref MASQUE_FRAGMENTS: IntCounter =
        register_int_counter!("masque_fragments_total", "QUIC datagram fragments emitted").unwrap();
    pub static ref CAPSULES_READ: IntCounter =
        register_int_counter!("capsules_read_total", "Capsules read from the Connect-IP stream").unwrap();
    pub static ref CAPSULES_WRITTEN: IntCounter = register_int_counter!(
        "capsules_written_total",
        "Capsules written to the Connect-IP stream"
    )
    .unwrap();
    pub static ref SUPERVISOR_LOCAL_FAILURES: IntCounter = register_int_counter!(
        "supervisor_local_failures_total",
        "Connection errors observed by this process's forwarding tasks"
    )
    .unwrap();
    pub static ref SUPERVISOR_GLOBAL_FAILURES: IntCounter = register_int_counter!(
        "supervisor_global_failures_total",
        "Connection errors observed process-wide (firewall-interference signal)"
    )
    .unwrap();
    pub static ref SUPERVISOR_RECOVERIES: IntCounter =
        register_int_counter!("supervisor_recoveries_total", "Completed recovery cycles").unwrap();
    pub static ref SUPERVISOR_CONNECTION_BROKEN: IntGauge = register_int_gauge!(
        "supervisor_connection_broken",
        "1 if the active session is currently marked broken"
    )
    .unwrap();
}

/// Serves the text-format metrics exposition on a background thread.
/// Mirrors the teacher's fire-and-forget `std::net::TcpListener` loop.
pub fn serve(addr: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::net::TcpListener;
    let listener = TcpListener::bind(addr)?;
    std::thread::spawn(move || {
        let encoder = TextEncoder::new();
        for stream in listener.incoming() {
            if let Ok(mut s) = stream {
                let metrics = prometheus::gather();
                let mut buf = Vec::new();
                if encoder.encode(&metrics, &mut buf).is_ok() {
                    let _ = s.write_all(&buf);
                }
            }
        }
    });
    Ok(())
}

/// Renders the current metrics as a string, used by `flush` and tests.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metrics = prometheus::gather();
    let mut buf = Vec::new();
    let _ = encoder.encode(&metrics, &mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

pub fn flush() {
    log::debug!("\n{}", render());
}
