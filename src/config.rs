use serde::{Deserialize, Serialize};

/// How hard to fail on best-effort conditions (jog misuse, corner-search
/// mismatch). The original controller software only logged these; whether
/// that was intentional is unknown, so it is a policy rather than a guess.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strictness {
    #[default]
    Lenient,
    Strict,
}

/// Parameters of the VS/VM/AT speed triple.
///
/// VM is confirmed as head speed in steps/second. VS and AT were never
/// confirmed (captured traces show VS near VM/4 and AT switching around
/// 1000 steps/s), so the mapping is overridable rather than hard-coded.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SpeedProfile {
    pub vs_divisor: f64,
    pub at_fast: i64,
    pub at_slow: i64,
    pub at_threshold: i64,
}

impl Default for SpeedProfile {
    fn default() -> Self {
        Self {
            vs_divisor: 4.0,
            at_fast: 20,
            at_slow: 10,
            at_threshold: 1000,
        }
    }
}

impl SpeedProfile {
    /// VS/VM/AT values for a head speed in steps/second.
    pub fn triple(&self, sps: i64) -> (i64, i64, i64) {
        let vs = (sps as f64 / self.vs_divisor) as i64;
        let at = if sps > self.at_threshold {
            self.at_fast
        } else {
            self.at_slow
        };
        (vs, sps, at)
    }
}

/// Machine profile saved to disk (port, bed extents, speeds, policy).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MachineProfile {
    pub port: String,
    /// Logical-frame travel extents in steps.
    pub bed_width_steps: i64,
    pub bed_height_steps: i64,
    /// Speed asserted right after the handshake, steps/second.
    pub initial_speed_sps: i64,
    /// Settle time after a head up/down transition, milliseconds.
    pub head_settle_ms: u64,
    /// Settle time after spindle on/off, milliseconds.
    pub spindle_settle_ms: u64,
    pub speed: SpeedProfile,
    pub strictness: Strictness,
}

impl Default for MachineProfile {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".into(),
            bed_width_steps: crate::transport::MOVEABLE_HEIGHT,
            bed_height_steps: crate::transport::MOVEABLE_WIDTH,
            initial_speed_sps: 4000,
            head_settle_ms: 500,
            spindle_settle_ms: 1000,
            speed: SpeedProfile::default(),
            strictness: Strictness::default(),
        }
    }
}

impl MachineProfile {
    fn json_path() -> std::path::PathBuf {
        std::env::current_exe()
            .unwrap_or_default()
            .parent()
            .unwrap_or(std::path::Path::new("."))
            .join("machine_profile.json")
    }

    pub fn load() -> Self {
        std::fs::read_to_string(Self::json_path())
            .ok()
            .and_then(|data| serde_json::from_str(&data).ok())
            .unwrap_or_default()
    }

    pub fn save(&self) {
        if let Ok(json) = serde_json::to_string_pretty(self) {
            let _ = std::fs::write(Self::json_path(), json);
        }
    }
}
