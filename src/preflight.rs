//! Module C — the preflight UDP bind.
//!
//! Wraps an inner [`Bind`] to inject obfuscation packets around a detected
//! WireGuard handshake initiation. Every other `Bind` operation passes
//! straight through unchanged; the only modified path is `send`. The
//! preflight sequence itself runs synchronously on the calling thread (spec
//! §4.C: "executed synchronously... so the source port matches"); only the
//! post-handshake junk burst is explicitly asynchronous, per spec, and runs
//! on a spawned thread.

use crate::config::WgParams;
use crate::cps::CpsTemplate;
use crate::telemetry::{PREFLIGHT_BURSTS, PREFLIGHT_JUNK_PACKETS, PREFLIGHT_SUPPRESSED};
use crate::wg_bind::{wrap_ikev2, Bind, Endpoint, RecvFn};
use rand::{Rng, RngCore};
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const INITIATION_SIZE: usize = 148;
const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(100);

/// True iff `buf` looks like a WireGuard handshake initiation (spec §4.C,
/// §6.2): at least 148 bytes, first byte `0x01`. Reserved bytes are not
/// checked — Cloudflare's WARP endpoints populate them.
pub fn is_wg_initiation(buf: &[u8]) -> bool {
    buf.len() >= INITIATION_SIZE && buf[0] == 0x01
}

fn gen_junk(jmin: i64, jmax: i64) -> Vec<u8> {
    let size = if jmin == 0 && jmax == 0 {
        1
    } else {
        let jmin = jmin.max(0) as usize;
        let jmax = jmax.max(jmin as i64) as usize;
        if jmin == jmax {
            jmin
        } else {
            rand::thread_rng().gen_range(jmin..=jmax)
        }
    };
    let mut buf = vec![0u8; size];
    if rand::rngs::OsRng.try_fill_bytes(&mut buf).is_err() {
        rand::thread_rng().fill_bytes(&mut buf);
    }
    buf
}

struct Templates {
    i1: Option<CpsTemplate>,
    i2: Option<CpsTemplate>,
    i3: Option<CpsTemplate>,
    i4: Option<CpsTemplate>,
    i5: Option<CpsTemplate>,
}

fn parse_optional(s: &str) -> Result<Option<CpsTemplate>, crate::error::CpsError> {
    if s.is_empty() {
        Ok(None)
    } else {
        Ok(Some(CpsTemplate::parse(s)?))
    }
}

/// Decorates an inner [`Bind`] with WireGuard handshake obfuscation. Itself
/// a `Bind`, so it can be handed to a WG device exactly like the bind it
/// wraps.
pub struct PreflightBind<B: Bind + 'static> {
    inner: Arc<B>,
    params: WgParams,
    min_interval: Duration,
    templates: Templates,
    last_sent: Mutex<HashMap<IpAddr, Instant>>,
    post_handshake_sent: Mutex<HashSet<IpAddr>>,
}

impl<B: Bind + 'static> PreflightBind<B> {
    pub fn new(inner: B, params: WgParams) -> Result<Self, crate::error::CpsError> {
        let templates = Templates {
            i1: parse_optional(&params.i1)?,
            i2: parse_optional(&params.i2)?,
            i3: parse_optional(&params.i3)?,
            i4: parse_optional(&params.i4)?,
            i5: parse_optional(&params.i5)?,
        };
        Ok(PreflightBind {
            inner: Arc::new(inner),
            params,
            min_interval: DEFAULT_MIN_INTERVAL,
            templates,
            last_sent: Mutex::new(HashMap::new()),
            post_handshake_sent: Mutex::new(HashSet::new()),
        })
    }

    fn check_rate_limit(&self, dst: IpAddr) -> bool {
        let mut last_sent = self.last_sent.lock().expect("preflight lock poisoned");
        let now = Instant::now();
        let allowed = match last_sent.get(&dst) {
            Some(prev) => now.duration_since(*prev) >= self.min_interval,
            None => true,
        };
        if allowed {
            last_sent.insert(dst, now);
        }
        allowed
    }

    fn run_preflight_sequence(&self, endpoint: Endpoint) {
        if let Some(i1) = &self.templates.i1 {
            match i1.compile() {
                Ok(bytes) => {
                    let wrapped = wrap_ikev2(&bytes);
                    if let Err(e) = self.inner.send(&[&wrapped], endpoint) {
                        log::debug!("preflight I1 send failed: {e}");
                    }
                }
                Err(e) => log::debug!("preflight I1 failed to compile: {e}"),
            }
        }

        thread::sleep(Duration::from_millis(2));

        for _ in 0..self.params.jc_before_hs.max(0) {
            let junk = gen_junk(self.params.jmin, self.params.jmax);
            if let Err(e) = self.inner.send(&[&junk], endpoint) {
                log::debug!("preflight junk send failed: {e}");
            }
            PREFLIGHT_JUNK_PACKETS.inc();
            thread::sleep(Duration::from_millis(1));
        }

        for tmpl in [
            &self.templates.i2,
            &self.templates.i3,
            &self.templates.i4,
            &self.templates.i5,
        ] {
            if let Some(tmpl) = tmpl {
                match tmpl.compile() {
                    Ok(bytes) => {
                        if let Err(e) = self.inner.send(&[&bytes], endpoint) {
                            log::debug!("preflight Ik send failed: {e}");
                        }
                    }
                    Err(e) => log::debug!("preflight Ik failed to compile: {e}"),
                }
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    fn maybe_schedule_post_handshake_junk(&self, endpoint: Endpoint) {
        let remaining = self.params.jc - self.params.jc_before_hs;
        if remaining <= 0 {
            return;
        }
        let dst = endpoint.dst_ip();
        {
            let mut seen = self.post_handshake_sent.lock().expect("preflight lock poisoned");
            if seen.contains(&dst) {
                return;
            }
            seen.insert(dst);
        }
        let inner = Arc::clone(&self.inner);
        let jmin = self.params.jmin;
        let jmax = self.params.jmax;
        thread::spawn(move || {
            for _ in 0..remaining {
                let junk = gen_junk(jmin, jmax);
                if let Err(e) = inner.send(&[&junk], endpoint) {
                    log::debug!("post-handshake junk send failed: {e}");
                }
                PREFLIGHT_JUNK_PACKETS.inc();
                thread::sleep(Duration::from_millis(1));
            }
        });
    }
}

impl<B: Bind + 'static> Bind for PreflightBind<B> {
    fn open(&self, port: u16) -> io::Result<(Vec<RecvFn>, u16)> {
        self.inner.open(port)
    }

    fn close(&self) -> io::Result<()> {
        self.inner.close()
    }

    fn set_mark(&self, mark: u32) -> io::Result<()> {
        self.inner.set_mark(mark)
    }

    fn parse_endpoint(&self, s: &str) -> io::Result<Endpoint> {
        self.inner.parse_endpoint(s)
    }

    fn batch_size(&self) -> usize {
        self.inner.batch_size()
    }

    /// Sends `bufs` to `endpoint`, injecting the preflight sequence first
    /// if the first buffer is a detected WireGuard initiation and the
    /// per-destination rate limit allows it. Preflight failures are logged
    /// and never propagated — only the real send's result is returned.
    fn send(&self, bufs: &[&[u8]], endpoint: Endpoint) -> io::Result<()> {
        let is_init = bufs.first().map(|b| is_wg_initiation(b)).unwrap_or(false);

        if is_init {
            let dst = endpoint.dst_ip();
            if self.check_rate_limit(dst) {
                PREFLIGHT_BURSTS.inc();
                self.run_preflight_sequence(endpoint);
            } else {
                PREFLIGHT_SUPPRESSED.inc();
            }
        }

        let result = self.inner.send(bufs, endpoint);

        if is_init {
            self.maybe_schedule_post_handshake_junk(endpoint);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wg_bind::MockBind;

    fn wg_init_packet() -> Vec<u8> {
        let mut buf = vec![0u8; INITIATION_SIZE];
        buf[0] = 0x01;
        buf
    }

    #[test]
    fn detects_initiation_by_length_and_first_byte() {
        assert!(is_wg_initiation(&wg_init_packet()));
        assert!(!is_wg_initiation(&[0x01; 10]));
        let mut not_init = wg_init_packet();
        not_init[0] = 0x02;
        assert!(!is_wg_initiation(&not_init));
    }

    #[test]
    fn rate_limit_suppresses_second_burst_to_same_ip() {
        let params = WgParams {
            i1: "<b 0c0d0e0f>".to_string(),
            jc: 2,
            jc_before_hs: 2,
            jmin: 4,
            jmax: 4,
            ..crate::config::wg_preset_defaults("minimal")
        };
        let mock = MockBind::new();
        let bind = PreflightBind::new(mock.clone(), params).unwrap();
        let ep = Endpoint("10.0.0.1:2408".parse().unwrap());

        bind.send(&[&wg_init_packet()], ep).unwrap();
        bind.send(&[&wg_init_packet()], ep).unwrap();

        let sent = mock.take_sent();
        // first burst: I1 (56 bytes) + 2 junk (4 bytes) + real init = 4 sends
        // second burst: just the real init = 1 send
        assert_eq!(sent.len(), 5);
    }

    #[test]
    fn distinct_ips_both_get_bursts() {
        let params = WgParams {
            i1: "<b 0c0d0e0f>".to_string(),
            jc: 1,
            jc_before_hs: 1,
            jmin: 4,
            jmax: 4,
            ..crate::config::wg_preset_defaults("minimal")
        };
        let mock = MockBind::new();
        let bind = PreflightBind::new(mock.clone(), params).unwrap();
        let ep1 = Endpoint("10.0.0.1:2408".parse().unwrap());
        let ep2 = Endpoint("10.0.0.2:2408".parse().unwrap());

        bind.send(&[&wg_init_packet()], ep1).unwrap();
        bind.send(&[&wg_init_packet()], ep2).unwrap();

        let sent = mock.take_sent();
        // 3 sends per burst (I1 + 1 junk + real init), two bursts
        assert_eq!(sent.len(), 6);
    }

    #[test]
    fn preflight_ordering_is_i1_junk_i2_i5() {
        let params = WgParams {
            i1: "<b 01>".to_string(),
            i2: "<b 02>".to_string(),
            i3: String::new(),
            i4: String::new(),
            i5: "<b 05>".to_string(),
            jc: 1,
            jc_before_hs: 1,
            jmin: 2,
            jmax: 2,
            ..crate::config::wg_preset_defaults("minimal")
        };
        let mock = MockBind::new();
        let bind = PreflightBind::new(mock.clone(), params).unwrap();
        let ep = Endpoint("10.0.0.9:2408".parse().unwrap());

        bind.send(&[&wg_init_packet()], ep).unwrap();
        let sent = mock.take_sent();
        // I1 (wrapped, 53 bytes), junk (2 bytes), I2 (1 byte), I5 (1 byte), real init
        assert_eq!(sent.len(), 5);
        assert_eq!(sent[0].1.len(), 52 + 1);
        assert_eq!(sent[2].1, vec![0x02]);
        assert_eq!(sent[3].1, vec![0x05]);
        assert_eq!(sent[4].1.len(), INITIATION_SIZE);
    }
}
