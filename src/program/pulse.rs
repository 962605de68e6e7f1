//! Pulse descriptions

use super::expr::Expr;
use serde::Serialize;
use std::fmt;

/// Envelope shape loaded into a pulse generator
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Envelope {
    Rect,
    /// Gaussian with the given standard deviation relative to the pulse length
    Gaussian { sigma: f64 },
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Envelope::Rect => write!(f, "rect"),
            Envelope::Gaussian { sigma } => write!(f, "gauss({})", sigma),
        }
    }
}

/// A shaped pulse
///
/// Frequency, phase and amplitude are optional; a pulse without them plays
/// with whatever the generator is currently configured to.
#[derive(Debug, Clone, PartialEq)]
pub struct Pulse {
    pub envelope: Envelope,
    pub length: Expr,
    pub frequency: Option<Expr>,
    pub phase: Option<Expr>,
    pub amplitude: Option<Expr>,
}

impl Pulse {
    /// Rectangular pulse of the given length
    pub fn new(length: impl Into<Expr>) -> Self {
        Self {
            envelope: Envelope::Rect,
            length: length.into(),
            frequency: None,
            phase: None,
            amplitude: None,
        }
    }

    pub fn envelope(mut self, envelope: Envelope) -> Self {
        self.envelope = envelope;
        self
    }

    pub fn frequency(mut self, frequency: impl Into<Expr>) -> Self {
        self.frequency = Some(frequency.into());
        self
    }

    pub fn phase(mut self, phase: impl Into<Expr>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn amplitude(mut self, amplitude: impl Into<Expr>) -> Self {
        self.amplitude = Some(amplitude.into());
        self
    }
}

/// Pulse as stored in a generator slot: envelope plus fixed length in cycles
/// (`None` for pulses that run until choked)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PulseShape {
    pub envelope: Envelope,
    pub cycles: Option<u64>,
}

impl fmt::Display for PulseShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cycles {
            Some(cycles) => write!(f, "{} x {}", self.envelope, cycles),
            None => write!(f, "{} x variable", self.envelope),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_methods() {
        let pulse = Pulse::new(20e-9).frequency(10e6).amplitude(0.5);
        assert_eq!(pulse.envelope, Envelope::Rect);
        assert!(pulse.frequency.is_some());
        assert!(pulse.phase.is_none());
        assert!(pulse.amplitude.is_some());
    }

    #[test]
    fn test_shape_display() {
        let shape = PulseShape {
            envelope: Envelope::Gaussian { sigma: 0.25 },
            cycles: Some(5),
        };
        assert_eq!(shape.to_string(), "gauss(0.25) x 5");
    }
}
