//! Physical units and their fixed-point representation on the sequencer

use super::expr::Literal;
use crate::error::{Error, Result};
use crate::types::Type;
use std::f64::consts::PI;

/// Sequencer clock
pub const CLOCK_HZ: f64 = 250e6;

/// Duration of one clock cycle in seconds
pub const CYCLE_TIME: f64 = 1.0 / CLOCK_HZ;

/// NCO phase increment per Hz
pub const NCO_PHASE_INCREMENT_PER_HZ: f64 = (1u64 << 30) as f64 / CLOCK_HZ;

/// NCO phase counter value per radian
pub const NCO_PHASE_PER_RADIAN: f64 = (1u64 << 16) as f64 / (2.0 * PI);

/// Register value of amplitude factor 1.0
pub const AMPLITUDE_MAX: f64 = 65535.0;

/// Seconds to clock cycles, rounding up partial cycles
pub fn time_to_cycles(seconds: f64) -> i64 {
    let cycles = seconds * CLOCK_HZ;
    let nearest = cycles.round();
    // floating point noise such as 3.0000000000000004 is not a partial cycle
    if (cycles - nearest).abs() < 1e-6 {
        nearest as i64
    } else {
        cycles.ceil() as i64
    }
}

pub fn cycles_to_time(cycles: i64) -> f64 {
    cycles as f64 * CYCLE_TIME
}

pub fn frequency_to_increment(hz: f64) -> i64 {
    (hz * NCO_PHASE_INCREMENT_PER_HZ).round() as i64
}

pub fn phase_to_nco(radians: f64) -> i64 {
    (radians * NCO_PHASE_PER_RADIAN).round() as i64
}

pub fn amplitude_to_register(factor: f64) -> i64 {
    (factor * AMPLITUDE_MAX).round() as i64
}

/// Integer representation of a literal of the given type
pub fn convert(value: Literal, ty: &Type) -> Result<i64> {
    match (ty, value) {
        (Type::Normal | Type::State, Literal::Int(v)) => Ok(v),
        (Type::Time, v) => Ok(time_to_cycles(v.as_f64())),
        (Type::Frequency, v) => Ok(frequency_to_increment(v.as_f64())),
        (Type::Phase, v) => Ok(phase_to_nco(v.as_f64())),
        (Type::Amplitude, v) => Ok(amplitude_to_register(v.as_f64())),
        (Type::Array(element, _), v) => convert(v, element),
        (ty, v) => Err(Error::unsupported(format!(
            "Constant {} can not be represented as {}",
            v, ty
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_conversion_rounds_up() {
        assert_eq!(time_to_cycles(20e-9), 5);
        assert_eq!(time_to_cycles(12e-9), 3);
        assert_eq!(time_to_cycles(13e-9), 4);
        assert_eq!(time_to_cycles(0.0), 0);
    }

    #[test]
    fn test_frequency_conversion() {
        assert_eq!(frequency_to_increment(10e6), 42949673);
        assert_eq!(convert(Literal::Float(10e6), &Type::Frequency).unwrap(), 42949673);
    }

    #[test]
    fn test_phase_and_amplitude() {
        assert_eq!(phase_to_nco(PI), 32768);
        assert_eq!(amplitude_to_register(1.0), 65535);
        assert_eq!(amplitude_to_register(0.5), 32768);
    }

    #[test]
    fn test_normal_is_unchanged() {
        assert_eq!(convert(Literal::Int(-7), &Type::Normal).unwrap(), -7);
        assert!(convert(Literal::Float(1.5), &Type::Normal).is_err());
    }
}
