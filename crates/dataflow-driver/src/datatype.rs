//! Element datatypes for accelerator I/O streams
//!
//! Quantized accelerators stream sub-byte integer and fixed-point values.
//! A [`Datatype`] describes the on-wire encoding of one tensor element; the
//! packed codec ([`crate::packing`]) uses it to drive its bit-width
//! arithmetic. Fixed-point values are carried as raw integer codes — the
//! driver never rescales, that is the application's job.

use crate::error::{DriverError, Result};
use std::str::FromStr;

/// Element datatype of an accelerator input or output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datatype {
    /// 1-bit bipolar value (-1 or +1), packed as 0/1
    Bipolar,
    /// Unsigned integer of the given bit width
    UInt(u8),
    /// Signed two's-complement integer of the given bit width
    Int(u8),
    /// Signed fixed point: total bit width and fractional bit count.
    /// Values are raw integer codes with `Int(bits)` range and encoding.
    Fixed {
        /// Total bit width
        bits: u8,
        /// Fractional bit count
        frac: u8,
    },
}

impl Datatype {
    /// Bits occupied by one element in the packed stream
    pub const fn bitwidth(self) -> usize {
        match self {
            Self::Bipolar => 1,
            Self::UInt(w) | Self::Int(w) | Self::Fixed { bits: w, .. } => w as usize,
        }
    }

    /// Whether elements are sign-extended on unpack
    pub const fn signed(self) -> bool {
        matches!(self, Self::Bipolar | Self::Int(_) | Self::Fixed { .. })
    }

    /// Smallest representable element value (as a raw code)
    pub fn min(self) -> i64 {
        match self {
            Self::Bipolar => -1,
            Self::UInt(_) => 0,
            Self::Int(w) | Self::Fixed { bits: w, .. } => -(1i64 << (w - 1)),
        }
    }

    /// Largest representable element value (as a raw code)
    pub fn max(self) -> i64 {
        match self {
            Self::Bipolar => 1,
            Self::UInt(w) => (1i64 << w) - 1,
            Self::Int(w) | Self::Fixed { bits: w, .. } => (1i64 << (w - 1)) - 1,
        }
    }

    /// Whether `value` is representable in this datatype
    pub fn allowed(self, value: i64) -> bool {
        match self {
            // Bipolar has no zero
            Self::Bipolar => value == -1 || value == 1,
            _ => value >= self.min() && value <= self.max(),
        }
    }

    /// Whether this datatype qualifies for the byte-reinterpretation fast
    /// path of the packed codec (exactly one byte per element)
    pub const fn is_byte_width(self) -> bool {
        self.bitwidth() == 8
    }
}

impl std::fmt::Display for Datatype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bipolar => write!(f, "BIPOLAR"),
            Self::UInt(w) => write!(f, "UINT{w}"),
            Self::Int(w) => write!(f, "INT{w}"),
            Self::Fixed { bits, frac } => write!(f, "FIXED<{bits},{frac}>"),
        }
    }
}

impl FromStr for Datatype {
    type Err = DriverError;

    /// Parse a datatype identifier as emitted by accelerator build metadata,
    /// e.g. `UINT8`, `INT4`, `BIPOLAR`, `FIXED<8,4>`.
    fn from_str(s: &str) -> Result<Self> {
        let bad = || DriverError::unsupported_datatype(format!("cannot parse datatype '{s}'"));
        if s == "BIPOLAR" {
            return Ok(Self::Bipolar);
        }
        if let Some(w) = s.strip_prefix("UINT") {
            return w.parse::<u8>().map(Self::UInt).map_err(|_| bad());
        }
        if let Some(w) = s.strip_prefix("INT") {
            return w.parse::<u8>().map(Self::Int).map_err(|_| bad());
        }
        if let Some(body) = s.strip_prefix("FIXED<").and_then(|r| r.strip_suffix('>')) {
            let (bits, frac) = body.split_once(',').ok_or_else(bad)?;
            return Ok(Self::Fixed {
                bits: bits.trim().parse().map_err(|_| bad())?,
                frac: frac.trim().parse().map_err(|_| bad())?,
            });
        }
        Err(bad())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitwidths() {
        assert_eq!(Datatype::Bipolar.bitwidth(), 1);
        assert_eq!(Datatype::UInt(2).bitwidth(), 2);
        assert_eq!(Datatype::Int(4).bitwidth(), 4);
        assert_eq!(Datatype::Fixed { bits: 8, frac: 4 }.bitwidth(), 8);
    }

    #[test]
    fn test_ranges() {
        assert_eq!(Datatype::UInt(8).max(), 255);
        assert_eq!(Datatype::Int(4).min(), -8);
        assert_eq!(Datatype::Int(4).max(), 7);
        assert!(Datatype::Bipolar.allowed(-1));
        assert!(!Datatype::Bipolar.allowed(0));
        assert!(!Datatype::UInt(2).allowed(4));
    }

    #[test]
    fn test_parse_roundtrip() {
        for s in ["BIPOLAR", "UINT8", "INT4", "FIXED<8,4>"] {
            let dt: Datatype = s.parse().unwrap();
            assert_eq!(dt.to_string(), s);
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("FLOAT32".parse::<Datatype>().is_err());
        assert!("UINTx".parse::<Datatype>().is_err());
    }
}
