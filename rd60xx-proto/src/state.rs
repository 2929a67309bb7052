//! Typed PSU state: the telemetry snapshot read back from a unit and the
//! optional-field write request applied to one.

use serde::{Deserialize, Serialize};

/// Active protection trip reported by the unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtectionStatus {
    Normal,
    Ovp,
    Ocp,
    Unknown,
}

impl From<u16> for ProtectionStatus {
    fn from(raw: u16) -> Self {
        match raw {
            0 => ProtectionStatus::Normal,
            1 => ProtectionStatus::Ovp,
            2 => ProtectionStatus::Ocp,
            _ => ProtectionStatus::Unknown,
        }
    }
}

/// Output regulation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    Cv,
    Cc,
    Unknown,
}

impl From<u16> for OutputMode {
    fn from(raw: u16) -> Self {
        match raw {
            0 => OutputMode::Cv,
            1 => OutputMode::Cc,
            _ => OutputMode::Unknown,
        }
    }
}

/// One stored preset group (M1..M9).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    pub v: f64,
    pub c: f64,
    pub ovp: f64,
    pub ocp: f64,
}

/// Full telemetry snapshot of one PSU at one poll instant.
///
/// Immutable value object: a poll replaces the whole snapshot, fields are
/// never updated individually.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub model: u16,
    pub serial_no: u32,
    pub firmware_version: String,
    pub temp_c: f64,
    pub temp_f: f64,
    /// Model-specific range selector word, carried raw.
    pub current_range: u16,
    pub output_voltage_set: f64,
    pub output_current_set: f64,
    pub ovp: f64,
    pub ocp: f64,
    pub output_voltage_disp: f64,
    pub output_current_disp: f64,
    pub output_power_disp: f64,
    pub input_voltage: f64,
    pub protection_status: ProtectionStatus,
    pub output_mode: OutputMode,
    pub output_enable: bool,
    pub battery_mode: bool,
    pub battery_voltage: f64,
    pub ext_temp_c: f64,
    pub ext_temp_f: f64,
    pub batt_ah: f64,
    pub batt_wh: f64,
    pub presets: Vec<Preset>,
}

impl Snapshot {
    /// Stable device key: `"{model}_{serial}"`.
    pub fn identity(&self) -> String {
        format!("{}_{}", self.model, self.serial_no)
    }
}

/// A state-write request. Absent fields are left unchanged on the unit.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StateSet {
    pub preset_index: Option<u16>,
    pub output_voltage_set: Option<f64>,
    pub output_current_set: Option<f64>,
    pub ovp: Option<f64>,
    pub ocp: Option<f64>,
    pub output_enable: Option<bool>,
    /// Flip the current output-enable state (read-modify-write).
    pub output_toggle: Option<bool>,
}

impl StateSet {
    /// True when no field is present.
    pub fn is_empty(&self) -> bool {
        self.preset_index.is_none()
            && self.output_voltage_set.is_none()
            && self.output_current_set.is_none()
            && self.ovp.is_none()
            && self.ocp.is_none()
            && self.output_enable.is_none()
            && self.output_toggle.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protection_status_mapping() {
        assert_eq!(ProtectionStatus::from(0), ProtectionStatus::Normal);
        assert_eq!(ProtectionStatus::from(1), ProtectionStatus::Ovp);
        assert_eq!(ProtectionStatus::from(2), ProtectionStatus::Ocp);
        assert_eq!(ProtectionStatus::from(99), ProtectionStatus::Unknown);
    }

    #[test]
    fn test_enum_json_rendering() {
        assert_eq!(
            serde_json::to_string(&ProtectionStatus::Ovp).unwrap(),
            "\"ovp\""
        );
        assert_eq!(serde_json::to_string(&OutputMode::Cv).unwrap(), "\"cv\"");
        assert_eq!(
            serde_json::to_string(&OutputMode::Unknown).unwrap(),
            "\"unknown\""
        );
    }

    #[test]
    fn test_state_set_partial_deserialize() {
        let set: StateSet = serde_json::from_str(r#"{"output_enable": true}"#).unwrap();
        assert_eq!(set.output_enable, Some(true));
        assert_eq!(set.output_voltage_set, None);
        assert!(!set.is_empty());
    }

    #[test]
    fn test_state_set_ignores_unknown_fields() {
        let set: StateSet =
            serde_json::from_str(r#"{"ovp": 13.5, "brightness": 4}"#).unwrap();
        assert_eq!(set.ovp, Some(13.5));
        assert!(set.output_toggle.is_none());
    }

    #[test]
    fn test_empty_state_set() {
        let set: StateSet = serde_json::from_str("{}").unwrap();
        assert!(set.is_empty());
    }
}
