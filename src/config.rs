//! Module A — the unified noize obfuscation configuration model.
//!
//! A [`NoizeConfig`] carries two optional sub-records, `wireguard` and
//! `masque`. Each chooses between a named preset and explicit parameters —
//! never both — modeled as [`PresetOrParams`] rather than an optional pair
//! of fields, so the variant survives loading, merging, and validation
//! without ever representing the invalid "both set" state in a typed field.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// The closed set of recognized presets (spec §4.A).
pub const PRESETS: &[&str] = &[
    "minimal", "light", "medium", "heavy", "stealth", "gfw", "firewall",
];

pub const DEFAULT_PRESET: &str = "medium";

/// A sub-record's parameters, or a named preset to derive them from.
/// Preset and explicit params are mutually exclusive (spec §4.A, §6.1).
#[derive(Debug, Clone, PartialEq)]
pub enum PresetOrParams<T> {
    Preset(String),
    Params(T),
}

impl<T: Clone> PresetOrParams<T> {
    pub fn preset_name(&self) -> Option<&str> {
        match self {
            PresetOrParams::Preset(name) => Some(name.as_str()),
            PresetOrParams::Params(_) => None,
        }
    }
}

/// WireGuard-side noize parameters (spec §6.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WgParams {
    #[serde(default)]
    pub i1: String,
    #[serde(default)]
    pub i2: String,
    #[serde(default)]
    pub i3: String,
    #[serde(default)]
    pub i4: String,
    #[serde(default)]
    pub i5: String,
    #[serde(default)]
    pub s1: i64,
    #[serde(default)]
    pub s2: i64,
    #[serde(default)]
    pub jc: i64,
    #[serde(default)]
    pub jmin: i64,
    #[serde(default)]
    pub jmax: i64,
    #[serde(default)]
    pub jc_after_i1: i64,
    #[serde(default)]
    pub jc_before_hs: i64,
    #[serde(default)]
    pub jc_after_hs: i64,
    #[serde(default, with = "duration_nanos")]
    pub junk_interval: Duration,
    #[serde(default, with = "duration_nanos")]
    pub handshake_delay: Duration,
    #[serde(default)]
    pub allow_zero_size: bool,
}

impl Default for WgParams {
    fn default() -> Self {
        wg_preset_defaults(DEFAULT_PRESET)
    }
}

/// MASQUE-side noize parameters (spec §6.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MasqueParams {
    #[serde(default)]
    pub i1: String,
    #[serde(default)]
    pub i2: String,
    #[serde(default)]
    pub i3: String,
    #[serde(default)]
    pub i4: String,
    #[serde(default)]
    pub i5: String,
    #[serde(default)]
    pub fragment_size: i64,
    #[serde(default)]
    pub fragment_initial: bool,
    #[serde(default, with = "duration_nanos")]
    pub fragment_delay: Duration,
    #[serde(default)]
    pub padding_min: i64,
    #[serde(default)]
    pub padding_max: i64,
    #[serde(default)]
    pub random_padding: bool,
    #[serde(default)]
    pub jc: i64,
    #[serde(default)]
    pub jmin: i64,
    #[serde(default)]
    pub jmax: i64,
    #[serde(default)]
    pub jc_before_hs: i64,
    #[serde(default)]
    pub jc_after_i1: i64,
    #[serde(default)]
    pub jc_during_hs: i64,
    #[serde(default)]
    pub jc_after_hs: i64,
    #[serde(default, with = "duration_nanos")]
    pub junk_interval: Duration,
    #[serde(default)]
    pub junk_random: bool,
    #[serde(default)]
    pub mimic_protocol: String,
    #[serde(default, with = "duration_nanos")]
    pub handshake_delay: Duration,
    #[serde(default)]
    pub random_delay: bool,
    #[serde(default, with = "duration_nanos")]
    pub delay_min: Duration,
    #[serde(default, with = "duration_nanos")]
    pub delay_max: Duration,
    #[serde(default, with = "duration_nanos")]
    pub packet_delay: Duration,
    #[serde(default)]
    pub sni_fragmentation: bool,
    #[serde(default)]
    pub sni_fragment: i64,
    #[serde(default)]
    pub fake_alpn: Vec<String>,
    #[serde(default)]
    pub use_timestamp: bool,
    #[serde(default)]
    pub use_nonce: bool,
    #[serde(default)]
    pub randomize_initial: bool,
    #[serde(default)]
    pub duplicate_packets: bool,
    #[serde(default)]
    pub reversed_order: bool,
    #[serde(default)]
    pub allow_zero_size: bool,
    #[serde(default)]
    pub fake_loss: f64,
}

impl Default for MasqueParams {
    fn default() -> Self {
        masque_preset_defaults(DEFAULT_PRESET)
    }
}

mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let nanos = u64::deserialize(d)?;
        Ok(Duration::from_nanos(nanos))
    }
}

/// Returns the deterministic default `WgParams` for a recognized preset.
/// Panics (via `unwrap` upstream) only if called with a name outside
/// [`PRESETS`]; callers validate the name first.
pub fn wg_preset_defaults(name: &str) -> WgParams {
    let (jc, before, after_i1, after_hs, jmin, jmax, junk_ms, hs_delay_ms) = match name {
        "minimal" => (0, 0, 0, 0, 0, 0, 0, 0),
        "light" => (4, 1, 1, 1, 40, 80, 20, 0),
        "medium" => (8, 3, 2, 2, 64, 128, 30, 0),
        "heavy" => (16, 6, 4, 4, 128, 256, 40, 200),
        "stealth" => (12, 4, 3, 3, 96, 192, 60, 500),
        "gfw" => (6, 2, 1, 1, 64, 140, 35, 100),
        "firewall" => (20, 8, 5, 5, 150, 300, 25, 0),
        _ => (8, 3, 2, 2, 64, 128, 30, 0), // medium fallback
    };
    WgParams {
        i1: String::new(),
        i2: String::new(),
        i3: String::new(),
        i4: String::new(),
        i5: String::new(),
        s1: 0,
        s2: 0,
        jc,
        jmin,
        jmax,
        jc_after_i1: after_i1,
        jc_before_hs: before,
        jc_after_hs: after_hs,
        junk_interval: Duration::from_millis(junk_ms),
        handshake_delay: Duration::from_millis(hs_delay_ms),
        allow_zero_size: jmin == 0 && jmax == 0,
    }
}

/// Returns the deterministic default `MasqueParams` for a recognized preset.
pub fn masque_preset_defaults(name: &str) -> MasqueParams {
    let (
        jc,
        before,
        after_i1,
        during,
        after_hs,
        jmin,
        jmax,
        mimic,
        sni_frag,
        frag_on,
        pad_max,
        fake_loss,
    ) = match name {
        "minimal" => (0, 0, 0, 0, 0, 0, 0, "", false, false, 0, 0.0),
        "light" => (4, 1, 1, 1, 1, 40, 80, "", false, false, 50, 0.0),
        "medium" => (10, 2, 3, 3, 2, 64, 128, "quic", false, false, 100, 0.0),
        "heavy" => (18, 4, 6, 4, 4, 128, 256, "https", true, true, 300, 0.02),
        "stealth" => (14, 3, 5, 4, 2, 96, 192, "dtls", true, true, 400, 0.03),
        "gfw" => (8, 2, 3, 2, 1, 64, 140, "https", true, true, 150, 0.01),
        "firewall" => (18, 5, 6, 5, 2, 150, 300, "stun", false, true, 500, 0.0),
        _ => (10, 2, 3, 3, 2, 64, 128, "quic", false, false, 100, 0.0),
    };
    MasqueParams {
        i1: String::new(),
        i2: String::new(),
        i3: String::new(),
        i4: String::new(),
        i5: String::new(),
        fragment_size: if frag_on { 256 } else { 0 },
        fragment_initial: frag_on,
        fragment_delay: Duration::from_millis(if frag_on { 10 } else { 0 }),
        padding_min: 0,
        padding_max: pad_max,
        random_padding: pad_max > 0,
        jc,
        jmin,
        jmax,
        jc_before_hs: before,
        jc_after_i1: after_i1,
        jc_during_hs: during,
        jc_after_hs: after_hs,
        junk_interval: Duration::from_millis(30),
        junk_random: jc > 0,
        mimic_protocol: mimic.to_string(),
        handshake_delay: Duration::from_millis(0),
        random_delay: false,
        delay_min: Duration::from_millis(0),
        delay_max: Duration::from_millis(0),
        packet_delay: Duration::from_millis(0),
        sni_fragmentation: sni_frag,
        sni_fragment: if sni_frag { 2 } else { 0 },
        fake_alpn: Vec::new(),
        use_timestamp: false,
        use_nonce: false,
        randomize_initial: false,
        duplicate_packets: false,
        reversed_order: false,
        allow_zero_size: jmin == 0 && jmax == 0,
        fake_loss,
    }
}

/// The `wireguard` sub-record.
#[derive(Debug, Clone, PartialEq)]
pub struct WgSection {
    pub enabled: bool,
    pub params: PresetOrParams<WgParams>,
}

impl WgSection {
    pub fn resolved(&self) -> WgParams {
        match &self.params {
            PresetOrParams::Preset(name) => wg_preset_defaults(name),
            PresetOrParams::Params(p) => p.clone(),
        }
    }
}

/// The `masque` sub-record.
#[derive(Debug, Clone, PartialEq)]
pub struct MasqueSection {
    pub enabled: bool,
    pub preferred: bool,
    pub params: PresetOrParams<MasqueParams>,
}

impl MasqueSection {
    pub fn resolved(&self) -> MasqueParams {
        match &self.params {
            PresetOrParams::Preset(name) => masque_preset_defaults(name),
            PresetOrParams::Params(p) => p.clone(),
        }
    }
}

/// Free-form provenance fields carried through load/merge/export verbatim
/// (spec §6.1). Calendar validation of `created_at` is out of scope —
/// any non-empty string is accepted as-is (see DESIGN.md).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub created_at: String,
}

/// The top-level noize configuration document (spec §3, §6.1).
#[derive(Debug, Clone, PartialEq)]
pub struct NoizeConfig {
    pub version: String,
    pub wireguard: Option<WgSection>,
    pub masque: Option<MasqueSection>,
    pub metadata: Option<Metadata>,
}

impl NoizeConfig {
    /// Loads a named preset as a complete config with both sub-records set
    /// to that preset, both enabled.
    pub fn load_preset(name: &str) -> Result<Self, ConfigError> {
        if !PRESETS.contains(&name) {
            return Err(ConfigError::invalid(format!("unknown preset '{name}'")));
        }
        Ok(NoizeConfig {
            version: "1.0".to_string(),
            wireguard: Some(WgSection {
                enabled: true,
                params: PresetOrParams::Preset(name.to_string()),
            }),
            masque: Some(MasqueSection {
                enabled: true,
                preferred: false,
                params: PresetOrParams::Preset(name.to_string()),
            }),
            metadata: None,
        })
    }

    /// Loads a config from a JSON file on disk.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Parses a config from a JSON string, honoring the preset/params XOR
    /// constraint per sub-record.
    pub fn from_json(s: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(s)?;
        raw.into_config()
    }

    /// Serializes this config back to pretty JSON (spec §6.1 shape).
    pub fn to_json(&self) -> Result<String, ConfigError> {
        let raw = RawConfig::from_config(self);
        Ok(serde_json::to_string_pretty(&raw)?)
    }

    /// Writes a preset's default config to `path` as JSON.
    pub fn export_preset(name: &str, path: &Path) -> Result<(), ConfigError> {
        let cfg = Self::load_preset(name)?;
        let json = cfg.to_json()?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Merges `override_cfg` onto `base`, per spec §4.A merge semantics:
    /// scalar fields overwrite iff the override value is non-zero/non-empty;
    /// boolean fields always overwrite; the sub-record variant
    /// (`Preset`/`Params`) of the override always wins when present.
    pub fn merge(base: &NoizeConfig, override_cfg: &NoizeConfig) -> NoizeConfig {
        NoizeConfig {
            version: if override_cfg.version.is_empty() {
                base.version.clone()
            } else {
                override_cfg.version.clone()
            },
            wireguard: merge_wg_section(&base.wireguard, &override_cfg.wireguard),
            masque: merge_masque_section(&base.masque, &override_cfg.masque),
            metadata: override_cfg.metadata.clone().or_else(|| base.metadata.clone()),
        }
    }

    /// Validates every rule in spec §4.A, failing on the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(wg) = &self.wireguard {
            if matches!(wg.params, PresetOrParams::Preset(_)) {
                // preset-derived params are defaults by construction, always valid
            } else {
                validate_wg_params(&wg.resolved())?;
            }
        }
        if let Some(masque) = &self.masque {
            if matches!(masque.params, PresetOrParams::Preset(_)) {
                // preset-derived params are defaults by construction, always valid
            } else {
                validate_masque_params(&masque.resolved())?;
            }
        }
        if let (Some(m1), Some(m2)) = (&self.masque, &self.wireguard) {
            if m1.enabled && m1.preferred && !m2.enabled {
                // masque-preferred needs a wireguard leg to fall back to; this
                // is enforced by the transport selector (module G), not here.
                let _ = (m1, m2);
            }
        }
        Ok(())
    }
}

fn merge_wg_section(base: &Option<WgSection>, over: &Option<WgSection>) -> Option<WgSection> {
    match (base, over) {
        (None, None) => None,
        (Some(b), None) => Some(b.clone()),
        (None, Some(o)) => Some(o.clone()),
        (Some(b), Some(o)) => Some(WgSection {
            enabled: o.enabled,
            params: match (&b.params, &o.params) {
                (PresetOrParams::Params(bp), PresetOrParams::Params(op)) => {
                    PresetOrParams::Params(merge_wg_params(bp, op))
                }
                _ => o.params.clone(),
            },
        }),
    }
}

fn merge_masque_section(
    base: &Option<MasqueSection>,
    over: &Option<MasqueSection>,
) -> Option<MasqueSection> {
    match (base, over) {
        (None, None) => None,
        (Some(b), None) => Some(b.clone()),
        (None, Some(o)) => Some(o.clone()),
        (Some(b), Some(o)) => Some(MasqueSection {
            enabled: o.enabled,
            preferred: o.preferred,
            params: match (&b.params, &o.params) {
                (PresetOrParams::Params(bp), PresetOrParams::Params(op)) => {
                    PresetOrParams::Params(merge_masque_params(bp, op))
                }
                _ => o.params.clone(),
            },
        }),
    }
}

macro_rules! overlay_scalar {
    ($base:expr, $over:expr) => {
        if $over == Default::default() {
            $base
        } else {
            $over
        }
    };
}

macro_rules! overlay_string {
    ($base:expr, $over:expr) => {
        if $over.is_empty() {
            $base
        } else {
            $over
        }
    };
}

fn merge_wg_params(b: &WgParams, o: &WgParams) -> WgParams {
    WgParams {
        i1: overlay_string!(b.i1.clone(), o.i1.clone()),
        i2: overlay_string!(b.i2.clone(), o.i2.clone()),
        i3: overlay_string!(b.i3.clone(), o.i3.clone()),
        i4: overlay_string!(b.i4.clone(), o.i4.clone()),
        i5: overlay_string!(b.i5.clone(), o.i5.clone()),
        s1: overlay_scalar!(b.s1, o.s1),
        s2: overlay_scalar!(b.s2, o.s2),
        jc: overlay_scalar!(b.jc, o.jc),
        jmin: overlay_scalar!(b.jmin, o.jmin),
        jmax: overlay_scalar!(b.jmax, o.jmax),
        jc_after_i1: overlay_scalar!(b.jc_after_i1, o.jc_after_i1),
        jc_before_hs: overlay_scalar!(b.jc_before_hs, o.jc_before_hs),
        jc_after_hs: overlay_scalar!(b.jc_after_hs, o.jc_after_hs),
        junk_interval: if o.junk_interval.is_zero() {
            b.junk_interval
        } else {
            o.junk_interval
        },
        handshake_delay: if o.handshake_delay.is_zero() {
            b.handshake_delay
        } else {
            o.handshake_delay
        },
        // boolean fields always overwrite
        allow_zero_size: o.allow_zero_size,
    }
}

fn merge_masque_params(b: &MasqueParams, o: &MasqueParams) -> MasqueParams {
    MasqueParams {
        i1: overlay_string!(b.i1.clone(), o.i1.clone()),
        i2: overlay_string!(b.i2.clone(), o.i2.clone()),
        i3: overlay_string!(b.i3.clone(), o.i3.clone()),
        i4: overlay_string!(b.i4.clone(), o.i4.clone()),
        i5: overlay_string!(b.i5.clone(), o.i5.clone()),
        fragment_size: overlay_scalar!(b.fragment_size, o.fragment_size),
        fragment_initial: o.fragment_initial,
        fragment_delay: if o.fragment_delay.is_zero() {
            b.fragment_delay
        } else {
            o.fragment_delay
        },
        padding_min: overlay_scalar!(b.padding_min, o.padding_min),
        padding_max: overlay_scalar!(b.padding_max, o.padding_max),
        random_padding: o.random_padding,
        jc: overlay_scalar!(b.jc, o.jc),
        jmin: overlay_scalar!(b.jmin, o.jmin),
        jmax: overlay_scalar!(b.jmax, o.jmax),
        jc_before_hs: overlay_scalar!(b.jc_before_hs, o.jc_before_hs),
        jc_after_i1: overlay_scalar!(b.jc_after_i1, o.jc_after_i1),
        jc_during_hs: overlay_scalar!(b.jc_during_hs, o.jc_during_hs),
        jc_after_hs: overlay_scalar!(b.jc_after_hs, o.jc_after_hs),
        junk_interval: if o.junk_interval.is_zero() {
            b.junk_interval
        } else {
            o.junk_interval
        },
        junk_random: o.junk_random,
        mimic_protocol: overlay_string!(b.mimic_protocol.clone(), o.mimic_protocol.clone()),
        handshake_delay: if o.handshake_delay.is_zero() {
            b.handshake_delay
        } else {
            o.handshake_delay
        },
        random_delay: o.random_delay,
        delay_min: if o.delay_min.is_zero() {
            b.delay_min
        } else {
            o.delay_min
        },
        delay_max: if o.delay_max.is_zero() {
            b.delay_max
        } else {
            o.delay_max
        },
        packet_delay: if o.packet_delay.is_zero() {
            b.packet_delay
        } else {
            o.packet_delay
        },
        sni_fragmentation: o.sni_fragmentation,
        sni_fragment: overlay_scalar!(b.sni_fragment, o.sni_fragment),
        fake_alpn: if o.fake_alpn.is_empty() {
            b.fake_alpn.clone()
        } else {
            o.fake_alpn.clone()
        },
        use_timestamp: o.use_timestamp,
        use_nonce: o.use_nonce,
        randomize_initial: o.randomize_initial,
        duplicate_packets: o.duplicate_packets,
        reversed_order: o.reversed_order,
        allow_zero_size: o.allow_zero_size,
        fake_loss: overlay_scalar!(b.fake_loss, o.fake_loss),
    }
}

/// Validation rules from spec §4.A.
pub fn validate_wg_params(p: &WgParams) -> Result<(), ConfigError> {
    if !(0..=128).contains(&p.jc) {
        return Err(ConfigError::invalid(format!("wireguard.jc {} out of [0,128]", p.jc)));
    }
    if !(p.jmin <= p.jmax && p.jmax <= 1400) {
        return Err(ConfigError::invalid("wireguard jmin/jmax out of range"));
    }
    if p.jc_after_i1 + p.jc_before_hs + p.jc_after_hs > p.jc {
        return Err(ConfigError::invalid(
            "wireguard jc_after_i1 + jc_before_hs + jc_after_hs exceeds jc",
        ));
    }
    if p.junk_interval > Duration::from_secs(5) {
        return Err(ConfigError::invalid("wireguard junk_interval exceeds 5s"));
    }
    if p.handshake_delay > Duration::from_secs(10) {
        return Err(ConfigError::invalid("wireguard handshake_delay exceeds 10s"));
    }
    if p.s1 != 0 || p.s2 != 0 {
        return Err(ConfigError::invalid("wireguard s1/s2 must be 0 for WARP compatibility"));
    }
    Ok(())
}

pub fn validate_masque_params(p: &MasqueParams) -> Result<(), ConfigError> {
    if !(0..=20).contains(&p.jc) {
        return Err(ConfigError::invalid(format!("masque.jc {} out of [0,20]", p.jc)));
    }
    if !(p.jmin <= p.jmax && p.jmax <= 1400) {
        return Err(ConfigError::invalid("masque jmin/jmax out of range"));
    }
    if p.jc_before_hs + p.jc_after_i1 + p.jc_during_hs + p.jc_after_hs > p.jc {
        return Err(ConfigError::invalid(
            "masque jc_before_hs + jc_after_i1 + jc_during_hs + jc_after_hs exceeds jc",
        ));
    }
    if p.fragment_initial && p.fragment_size < 64 {
        return Err(ConfigError::invalid("masque fragment_size must be >= 64 when enabled"));
    }
    if p.padding_max > 500 {
        return Err(ConfigError::invalid("masque padding_max exceeds 500"));
    }
    if p.junk_interval > Duration::from_secs(5) {
        return Err(ConfigError::invalid("masque junk_interval exceeds 5s"));
    }
    if p.handshake_delay > Duration::from_secs(10) {
        return Err(ConfigError::invalid("masque handshake_delay exceeds 10s"));
    }
    const MIMIC_PROTOCOLS: &[&str] = &["", "dns", "https", "h3", "dtls", "stun", "quic"];
    if !MIMIC_PROTOCOLS.contains(&p.mimic_protocol.as_str()) {
        return Err(ConfigError::invalid(format!(
            "masque mimic_protocol '{}' not recognized",
            p.mimic_protocol
        )));
    }
    if !(0.0..=1.0).contains(&p.fake_loss) {
        return Err(ConfigError::invalid("masque fake_loss out of [0.0, 1.0]"));
    }
    Ok(())
}

/// A mode-conflict check used by the transport selector (module G, spec
/// §4.G): the named combinations are mutually exclusive. Kept here because
/// it validates the same `masque`/`masque.preferred` flags this module
/// owns.
pub fn check_mode_conflicts(
    masque: bool,
    masque_preferred: bool,
    gool: bool,
    psiphon: bool,
) -> Result<(), ConfigError> {
    let combos: &[(bool, &str)] = &[
        (masque && gool, "masque and gool"),
        (masque && psiphon, "masque and psiphon"),
        (masque && masque_preferred, "masque and masque-preferred"),
        (masque_preferred && gool, "masque-preferred and gool"),
        (masque_preferred && psiphon, "masque-preferred and psiphon"),
    ];
    for (bad, msg) in combos {
        if *bad {
            return Err(ConfigError::invalid(format!(
                "mode conflict: {msg} cannot both be enabled"
            )));
        }
    }
    Ok(())
}

// --- Raw JSON shape (spec §6.1), bridging to the typed model above. ---

#[derive(Serialize, Deserialize)]
struct RawConfig {
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    wireguard: Option<RawWgSection>,
    #[serde(default)]
    masque: Option<RawMasqueSection>,
    #[serde(default)]
    metadata: Option<Metadata>,
}

fn default_version() -> String {
    "1.0".to_string()
}

#[derive(Serialize, Deserialize)]
struct RawWgSection {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    preset: Option<String>,
    #[serde(default, rename = "atomicnoize")]
    atomicnoize: Option<WgParams>,
}

#[derive(Serialize, Deserialize)]
struct RawMasqueSection {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    preferred: bool,
    #[serde(default)]
    preset: Option<String>,
    #[serde(default)]
    config: Option<MasqueParams>,
}

impl RawConfig {
    fn into_config(self) -> Result<NoizeConfig, ConfigError> {
        let wireguard = match self.wireguard {
            None => None,
            Some(raw) => {
                let params = match (raw.preset, raw.atomicnoize) {
                    (Some(_), Some(_)) => {
                        return Err(ConfigError::invalid(
                            "wireguard: preset and atomicnoize are mutually exclusive",
                        ))
                    }
                    (Some(name), None) => {
                        if !PRESETS.contains(&name.as_str()) {
                            return Err(ConfigError::invalid(format!(
                                "unknown wireguard preset '{name}'"
                            )));
                        }
                        PresetOrParams::Preset(name)
                    }
                    (None, Some(p)) => PresetOrParams::Params(p),
                    (None, None) => PresetOrParams::Preset(DEFAULT_PRESET.to_string()),
                };
                Some(WgSection {
                    enabled: raw.enabled,
                    params,
                })
            }
        };
        let masque = match self.masque {
            None => None,
            Some(raw) => {
                let params = match (raw.preset, raw.config) {
                    (Some(_), Some(_)) => {
                        return Err(ConfigError::invalid(
                            "masque: preset and config are mutually exclusive",
                        ))
                    }
                    (Some(name), None) => {
                        if !PRESETS.contains(&name.as_str()) {
                            return Err(ConfigError::invalid(format!(
                                "unknown masque preset '{name}'"
                            )));
                        }
                        PresetOrParams::Preset(name)
                    }
                    (None, Some(p)) => PresetOrParams::Params(p),
                    (None, None) => PresetOrParams::Preset(DEFAULT_PRESET.to_string()),
                };
                Some(MasqueSection {
                    enabled: raw.enabled,
                    preferred: raw.preferred,
                    params,
                })
            }
        };
        Ok(NoizeConfig {
            version: self.version,
            wireguard,
            masque,
            metadata: self.metadata,
        })
    }

    fn from_config(cfg: &NoizeConfig) -> Self {
        RawConfig {
            version: cfg.version.clone(),
            wireguard: cfg.wireguard.as_ref().map(|w| RawWgSection {
                enabled: w.enabled,
                preset: w.params.preset_name().map(str::to_string),
                atomicnoize: match &w.params {
                    PresetOrParams::Params(p) => Some(p.clone()),
                    PresetOrParams::Preset(_) => None,
                },
            }),
            masque: cfg.masque.as_ref().map(|m| RawMasqueSection {
                enabled: m.enabled,
                preferred: m.preferred,
                preset: m.params.preset_name().map(str::to_string),
                config: match &m.params {
                    PresetOrParams::Params(p) => Some(p.clone()),
                    PresetOrParams::Preset(_) => None,
                },
            }),
            metadata: cfg.metadata.clone(),
        }
    }
}
