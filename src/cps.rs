//! Module B — the CPS (Custom Protocol Signature) packet compiler.
//!
//! A signature template is a sequence of angle-bracketed tags compiled to a
//! byte vector. Static templates (only `<b>`/`<x>` tags) compile once and
//! are cached; templates containing `<t>`, `<c>`, `<r>`, or `<n>` recompile
//! on every call since their output depends on the clock or an RNG.

use crate::error::CpsError;
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

const MAX_RANDOM_BYTES: usize = 1000;

#[derive(Debug, Clone, PartialEq)]
enum Op {
    Literal(Vec<u8>),
    Timestamp,
    Counter,
    Random(usize),
    Nonce,
    Xor(u8),
}

/// A parsed, ready-to-compile signature template.
pub struct CpsTemplate {
    ops: Vec<Op>,
    dynamic: bool,
    cached: Mutex<Option<Vec<u8>>>,
}

impl CpsTemplate {
    /// Parses `template` into its tag sequence. Parsing is pure; no bytes
    /// are produced until [`CpsTemplate::compile`] is called.
    pub fn parse(template: &str) -> Result<Self, CpsError> {
        let ops = parse_ops(template)?;
        let dynamic = ops
            .iter()
            .any(|op| matches!(op, Op::Timestamp | Op::Counter | Op::Random(_) | Op::Nonce));
        Ok(CpsTemplate {
            ops,
            dynamic,
            cached: Mutex::new(None),
        })
    }

    /// True if this template is empty (no tags at all), i.e. the `I_k`
    /// slot it backs is disabled per spec §4.C/§4.D ("if non-empty").
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Compiles the template to bytes. Static templates are compiled once
    /// and the cached bytes are cloned out on every subsequent call;
    /// dynamic templates (containing `<t>`, `<c>`, `<r>`, or `<n>`)
    /// recompile fresh each time.
    pub fn compile(&self) -> Result<Vec<u8>, CpsError> {
        if !self.dynamic {
            let mut guard = self.cached.lock().expect("cps cache lock poisoned");
            if let Some(bytes) = &*guard {
                return Ok(bytes.clone());
            }
            let bytes = run_ops(&self.ops)?;
            *guard = Some(bytes.clone());
            return Ok(bytes);
        }
        run_ops(&self.ops)
    }
}

/// Compiles `template` directly, without retaining the parsed form. Useful
/// for one-off compiles (tests, the CLI tool); hot paths should parse once
/// into a [`CpsTemplate`] and call [`CpsTemplate::compile`] repeatedly.
pub fn compile(template: &str) -> Result<Vec<u8>, CpsError> {
    CpsTemplate::parse(template)?.compile()
}

fn run_ops(ops: &[Op]) -> Result<Vec<u8>, CpsError> {
    let mut out = Vec::new();
    for op in ops {
        match op {
            Op::Literal(bytes) => out.extend_from_slice(bytes),
            Op::Timestamp => {
                let secs = now_unix_secs();
                out.extend_from_slice(&(secs as u32).to_be_bytes());
            }
            Op::Counter => {
                let secs = now_unix_secs();
                out.extend_from_slice(&(secs as u32).to_be_bytes());
            }
            Op::Random(n) => {
                let n = (*n).min(MAX_RANDOM_BYTES);
                let mut buf = vec![0u8; n];
                OsRng.try_fill_bytes(&mut buf).map_err(|_| CpsError::RngFailure)?;
                out.extend_from_slice(&buf);
            }
            Op::Nonce => {
                let nanos = now_unix_nanos();
                out.extend_from_slice(&nanos.to_be_bytes());
            }
            Op::Xor(key) => {
                for b in out.iter_mut() {
                    *b ^= key;
                }
            }
        }
    }
    Ok(out)
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn now_unix_nanos() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    // guarantee strictly increasing nonces even under a coarse clock
    let prev = COUNTER.load(Ordering::Relaxed);
    let next = t.max(prev.wrapping_add(1));
    COUNTER.store(next, Ordering::Relaxed);
    next
}

fn parse_ops(template: &str) -> Result<Vec<Op>, CpsError> {
    let mut ops = Vec::new();
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b' ' | b'\t' | b'\n' | b'\r' => {
                i += 1;
                continue;
            }
            b'<' => {
                let close = template[i..]
                    .find('>')
                    .map(|off| i + off)
                    .ok_or(CpsError::BadTag(i))?;
                let inner = &template[i + 1..close];
                ops.push(parse_tag(inner, i)?);
                i = close + 1;
            }
            _ => return Err(CpsError::BadTag(i)),
        }
    }
    Ok(ops)
}

fn parse_tag(inner: &str, pos: usize) -> Result<Op, CpsError> {
    let mut parts = inner.trim().splitn(2, char::is_whitespace);
    let tag = parts.next().unwrap_or("");
    let arg = parts.next().unwrap_or("").trim();
    match tag {
        "b" => Ok(Op::Literal(parse_hex(arg)?)),
        "t" => Ok(Op::Timestamp),
        "c" => Ok(Op::Counter),
        "n" => Ok(Op::Nonce),
        "r" => {
            let n: usize = arg
                .parse()
                .map_err(|_| CpsError::BadLength(arg.to_string()))?;
            Ok(Op::Random(n))
        }
        "x" => {
            let bytes = parse_hex(arg)?;
            if bytes.len() != 1 {
                return Err(CpsError::BadLength(format!(
                    "<x> expects a single byte, got {} bytes",
                    bytes.len()
                )));
            }
            Ok(Op::Xor(bytes[0]))
        }
        _ => Err(CpsError::BadTag(pos)),
    }
}

fn parse_hex(arg: &str) -> Result<Vec<u8>, CpsError> {
    let stripped: String = arg.chars().filter(|c| !c.is_whitespace()).collect();
    let stripped = stripped
        .strip_prefix("0x")
        .or_else(|| stripped.strip_prefix("0X"))
        .unwrap_or(&stripped);
    if stripped.is_empty() || stripped.len() % 2 != 0 {
        return Err(CpsError::BadHex(arg.to_string()));
    }
    let mut out = Vec::with_capacity(stripped.len() / 2);
    let chars: Vec<char> = stripped.chars().collect();
    for pair in chars.chunks(2) {
        let s: String = pair.iter().collect();
        let byte = u8::from_str_radix(&s, 16).map_err(|_| CpsError::BadHex(arg.to_string()))?;
        out.push(byte);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_hex_with_prefix_and_whitespace() {
        let out = compile("<b 0x0c 0d 0e 0f>").unwrap();
        assert_eq!(out, vec![0x0c, 0x0d, 0x0e, 0x0f]);
    }

    #[test]
    fn random_length_capped_at_1000() {
        let out = compile("<r 5000>").unwrap();
        assert_eq!(out.len(), 1000);
    }

    #[test]
    fn random_length_exact() {
        let out = compile("<r 3>").unwrap();
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn bad_hex_is_rejected() {
        let err = compile("<b zz>").unwrap_err();
        assert!(matches!(err, CpsError::BadHex(_)));
    }

    #[test]
    fn xor_flips_previous_bytes() {
        let out = compile("<b 00ff><x ff>").unwrap();
        assert_eq!(out, vec![0xff, 0x00]);
    }

    #[test]
    fn empty_template_is_empty() {
        let t = CpsTemplate::parse("").unwrap();
        assert!(t.is_empty());
        assert_eq!(t.compile().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn dynamic_template_has_expected_length() {
        // <b AA><t><r 3> => 1 + 4 + 3 = 8 bytes, starts with 0xAA
        let out = compile("<b AA><t><r 3>").unwrap();
        assert_eq!(out.len(), 8);
        assert_eq!(out[0], 0xAA);
    }

    #[test]
    fn static_template_is_cached() {
        let t = CpsTemplate::parse("<b 00112233>").unwrap();
        let a = t.compile().unwrap();
        let b = t.compile().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = compile("<z>").unwrap_err();
        assert!(matches!(err, CpsError::BadTag(_)));
    }
}
