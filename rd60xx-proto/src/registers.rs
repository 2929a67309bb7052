//! RD60xx register map and fixed-point scaling.
//!
//! Register layout shared by the RD6006/RD6012/RD6018/RD6024 firmware.
//! Words not named here are reserved or calibration registers; reads carry
//! them through untouched so newer firmware revisions keep working.

use crate::error::RegisterError;
use crate::state::{OutputMode, Preset, ProtectionStatus, Snapshot, StateSet};

/// Fixed slave address the PSU firmware answers on.
pub const UNIT_ADDRESS: u8 = 1;

/// Register numbers.
pub mod reg {
    pub const MODEL: u16 = 0;
    pub const SERIAL_HI: u16 = 1;
    pub const SERIAL_LO: u16 = 2;
    pub const FIRMWARE: u16 = 3;
    /// 0 = positive, 1 = negative.
    pub const TEMP_C_SIGN: u16 = 4;
    pub const TEMP_C_VALUE: u16 = 5;
    pub const TEMP_F_SIGN: u16 = 6;
    pub const TEMP_F_VALUE: u16 = 7;
    pub const OUTPUT_VOLTAGE_SET: u16 = 8;
    pub const OUTPUT_CURRENT_SET: u16 = 9;
    pub const OUTPUT_VOLTAGE_DISP: u16 = 10;
    pub const OUTPUT_CURRENT_DISP: u16 = 11;
    pub const OUTPUT_POWER_HI: u16 = 12;
    pub const OUTPUT_POWER_LO: u16 = 13;
    pub const INPUT_VOLTAGE: u16 = 14;
    pub const KEYPAD_LOCK: u16 = 15;
    /// 0 = none, 1 = OVP, 2 = OCP.
    pub const PROTECTION_STATUS: u16 = 16;
    /// 0 = CV, 1 = CC.
    pub const OUTPUT_MODE: u16 = 17;
    pub const OUTPUT_ENABLE: u16 = 18;
    pub const PRESET_SELECT: u16 = 19;
    /// Model-specific current-range selector (RD6012P); raw pass-through.
    pub const CURRENT_RANGE: u16 = 20;
    pub const BATTERY_MODE: u16 = 32;
    pub const BATTERY_VOLTAGE: u16 = 33;
    pub const EXT_TEMP_C_SIGN: u16 = 34;
    pub const EXT_TEMP_C_VALUE: u16 = 35;
    pub const EXT_TEMP_F_SIGN: u16 = 36;
    pub const EXT_TEMP_F_VALUE: u16 = 37;
    pub const BATT_AH_HI: u16 = 38;
    pub const BATT_AH_LO: u16 = 39;
    pub const BATT_WH_HI: u16 = 40;
    pub const BATT_WH_LO: u16 = 41;
    /// Clock block: year, month, day, hour, minute, second.
    pub const CLOCK_YEAR: u16 = 48;
    /// Preset groups M0..M9, four words each: V, C, OVP, OCP. M0 is the live
    /// working set.
    pub const PRESET_BASE: u16 = 80;
}

/// First register of the main telemetry block.
pub const TELEMETRY_START: u16 = reg::MODEL;
/// Word count of the main telemetry block (registers 0..=41).
pub const TELEMETRY_COUNT: u16 = reg::BATT_WH_LO - reg::MODEL + 1;
/// First register of the preset block.
pub const PRESET_START: u16 = reg::PRESET_BASE;
/// Word count of the preset block (M0..M9, four words each).
pub const PRESET_COUNT: u16 = 40;
/// Word count of the identity read (model + serial).
pub const IDENTITY_COUNT: u16 = 3;
/// Presets published per unit (M1..M9).
pub const PUBLISHED_PRESETS: usize = 9;

const FIRMWARE_SCALE: f64 = 100.0;
const POWER_SCALE: f64 = 100.0;
const BATTERY_SCALE: f64 = 1000.0;

/// Per-model fixed-point divisors for voltage and current words.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scaling {
    pub voltage: f64,
    pub current: f64,
}

impl Scaling {
    /// Look up scaling by model number. The trailing digit of the model word
    /// is a hardware revision and is ignored.
    pub fn for_model(model: u16) -> Option<Self> {
        match model / 10 {
            6006 => Some(Self {
                voltage: 100.0,
                current: 1000.0,
            }),
            6012 | 6018 | 6024 => Some(Self {
                voltage: 100.0,
                current: 100.0,
            }),
            _ => None,
        }
    }

    pub fn volts(&self, raw: u16) -> f64 {
        f64::from(raw) / self.voltage
    }

    pub fn amps(&self, raw: u16) -> f64 {
        f64::from(raw) / self.current
    }

    pub fn volts_to_raw(&self, volts: f64) -> u16 {
        (volts * self.voltage).round() as u16
    }

    pub fn amps_to_raw(&self, amps: f64) -> u16 {
        (amps * self.current).round() as u16
    }
}

/// Decode the identity read (registers 0..=2) into (model, serial number).
pub fn decode_identity(words: &[u16]) -> Result<(u16, u32), RegisterError> {
    if words.len() < IDENTITY_COUNT as usize {
        return Err(RegisterError::BlockLength {
            expected: IDENTITY_COUNT as usize,
            got: words.len(),
        });
    }
    let serial = (u32::from(words[reg::SERIAL_HI as usize]) << 16)
        | u32::from(words[reg::SERIAL_LO as usize]);
    Ok((words[reg::MODEL as usize], serial))
}

/// Decode the main telemetry block plus the preset block into a [`Snapshot`].
///
/// `main` must hold [`TELEMETRY_COUNT`] words starting at register 0;
/// `presets` must hold [`PRESET_COUNT`] words starting at register 80.
pub fn decode_snapshot(main: &[u16], presets: &[u16]) -> Result<Snapshot, RegisterError> {
    if main.len() != TELEMETRY_COUNT as usize {
        return Err(RegisterError::BlockLength {
            expected: TELEMETRY_COUNT as usize,
            got: main.len(),
        });
    }
    if presets.len() != PRESET_COUNT as usize {
        return Err(RegisterError::BlockLength {
            expected: PRESET_COUNT as usize,
            got: presets.len(),
        });
    }

    let word = |register: u16| main[register as usize];
    let word32 = |hi: u16, lo: u16| (u32::from(word(hi)) << 16) | u32::from(word(lo));
    // Temperatures are a sign word (1 = negative) plus a magnitude word.
    let temp = |sign: u16, value: u16| {
        let magnitude = f64::from(word(value));
        if word(sign) == 1 { -magnitude } else { magnitude }
    };

    let model = word(reg::MODEL);
    let scaling = Scaling::for_model(model).ok_or(RegisterError::UnknownModel(model))?;

    let preset_groups: Vec<Preset> = presets[4..]
        .chunks_exact(4)
        .map(|group| Preset {
            v: scaling.volts(group[0]),
            c: scaling.amps(group[1]),
            ovp: scaling.volts(group[2]),
            ocp: scaling.amps(group[3]),
        })
        .collect();

    Ok(Snapshot {
        model,
        serial_no: word32(reg::SERIAL_HI, reg::SERIAL_LO),
        firmware_version: format!("{}", f64::from(word(reg::FIRMWARE)) / FIRMWARE_SCALE),
        temp_c: temp(reg::TEMP_C_SIGN, reg::TEMP_C_VALUE),
        temp_f: temp(reg::TEMP_F_SIGN, reg::TEMP_F_VALUE),
        current_range: word(reg::CURRENT_RANGE),
        output_voltage_set: scaling.volts(word(reg::OUTPUT_VOLTAGE_SET)),
        output_current_set: scaling.amps(word(reg::OUTPUT_CURRENT_SET)),
        // Live OVP/OCP come from the working preset group M0.
        ovp: scaling.volts(presets[2]),
        ocp: scaling.amps(presets[3]),
        output_voltage_disp: scaling.volts(word(reg::OUTPUT_VOLTAGE_DISP)),
        output_current_disp: scaling.amps(word(reg::OUTPUT_CURRENT_DISP)),
        output_power_disp: f64::from(word32(reg::OUTPUT_POWER_HI, reg::OUTPUT_POWER_LO))
            / POWER_SCALE,
        input_voltage: scaling.volts(word(reg::INPUT_VOLTAGE)),
        protection_status: ProtectionStatus::from(word(reg::PROTECTION_STATUS)),
        output_mode: OutputMode::from(word(reg::OUTPUT_MODE)),
        output_enable: word(reg::OUTPUT_ENABLE) != 0,
        battery_mode: word(reg::BATTERY_MODE) != 0,
        battery_voltage: scaling.volts(word(reg::BATTERY_VOLTAGE)),
        ext_temp_c: temp(reg::EXT_TEMP_C_SIGN, reg::EXT_TEMP_C_VALUE),
        ext_temp_f: temp(reg::EXT_TEMP_F_SIGN, reg::EXT_TEMP_F_VALUE),
        batt_ah: f64::from(word32(reg::BATT_AH_HI, reg::BATT_AH_LO)) / BATTERY_SCALE,
        batt_wh: f64::from(word32(reg::BATT_WH_HI, reg::BATT_WH_LO)) / BATTERY_SCALE,
        presets: preset_groups,
    })
}

/// One register write, ready for frame encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Single { register: u16, value: u16 },
    Block { start: u16, values: Vec<u16> },
}

/// Translate a [`StateSet`] into the register writes it requires, in apply
/// order. `output_toggle` is excluded: it needs a read-modify-write and is
/// composed by the dispatcher from [`reg::OUTPUT_ENABLE`].
///
/// Voltage and current both target the working preset group M0 (writing the
/// set-value registers directly does not update the stored group); when both
/// are present they go out as one grouped write.
pub fn encode_set(set: &StateSet, scaling: Scaling) -> Vec<WriteOp> {
    let mut ops = Vec::new();

    if let Some(index) = set.preset_index {
        ops.push(WriteOp::Single {
            register: reg::PRESET_SELECT,
            value: index,
        });
    }

    let volts = set.output_voltage_set.map(|v| scaling.volts_to_raw(v));
    let amps = set.output_current_set.map(|c| scaling.amps_to_raw(c));
    match (volts, amps) {
        (Some(v), Some(c)) => ops.push(WriteOp::Block {
            start: reg::PRESET_BASE,
            values: vec![v, c],
        }),
        (Some(v), None) => ops.push(WriteOp::Single {
            register: reg::PRESET_BASE,
            value: v,
        }),
        (None, Some(c)) => ops.push(WriteOp::Single {
            register: reg::PRESET_BASE + 1,
            value: c,
        }),
        (None, None) => {}
    }

    if let Some(ovp) = set.ovp {
        ops.push(WriteOp::Single {
            register: reg::PRESET_BASE + 2,
            value: scaling.volts_to_raw(ovp),
        });
    }
    if let Some(ocp) = set.ocp {
        ops.push(WriteOp::Single {
            register: reg::PRESET_BASE + 3,
            value: scaling.amps_to_raw(ocp),
        });
    }
    if let Some(enable) = set.output_enable {
        ops.push(output_enable_op(enable));
    }

    ops
}

/// Write op flipping the output on or off.
pub fn output_enable_op(enabled: bool) -> WriteOp {
    WriteOp::Single {
        register: reg::OUTPUT_ENABLE,
        value: u16::from(enabled),
    }
}

/// Write op setting the on-unit clock.
pub fn clock_op(year: u16, month: u16, day: u16, hour: u16, minute: u16, second: u16) -> WriteOp {
    WriteOp::Block {
        start: reg::CLOCK_YEAR,
        values: vec![year, month, day, hour, minute, second],
    }
}
