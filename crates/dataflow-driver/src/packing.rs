//! Bit-level packing codec between folded tensors and device byte streams
//!
//! The accelerator consumes the innermost (lane) dimension of a folded
//! tensor as one packed word per row: element bits are concatenated
//! MSB-first and left-padded to a whole number of bytes. Two reversal flags
//! adapt that host-natural layout to the streaming hardware, which presents
//! the least-significant lane first:
//!
//! - `reverse_inner` reverses lane order within each row before packing
//! - `reverse_endian` reverses the byte order of each packed row
//!
//! The driver always sets both (see [`crate::Accelerator::pack_input`]).
//! For 8-bit datatypes with both flags equal the two reversals cancel, so a
//! direct byte-reinterpretation fast path applies; it is byte-identical to
//! the general path (tested below).

// Codes are masked to the datatype's bit width before any narrowing cast
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]

use crate::datatype::Datatype;
use crate::error::{DriverError, Result};
use crate::shapes::Shape;
use crate::tensor::Tensor;

/// Widest element the codec packs; wider datatypes are rejected
pub const MAX_BITWIDTH: usize = 32;

/// Bytes one packed row of `inner` elements occupies
///
/// # Errors
///
/// Returns [`DriverError::UnsupportedDatatype`] for bit widths outside
/// `1..=`[`MAX_BITWIDTH`].
pub fn packed_row_bytes(inner: usize, dt: Datatype) -> Result<usize> {
    Ok((inner * checked_width(dt)? + 7) / 8)
}

/// Pack a folded tensor into the accelerator's byte stream
///
/// # Errors
///
/// Returns [`DriverError::UnsupportedDatatype`] for unhandled bit widths and
/// [`DriverError::Precondition`] for element values outside the datatype's
/// range.
pub fn pack(
    tensor: &Tensor,
    dt: Datatype,
    reverse_endian: bool,
    reverse_inner: bool,
) -> Result<Vec<u8>> {
    let w = checked_width(dt)?;
    if w == 8 && reverse_endian == reverse_inner {
        // Lane reversal and byte reversal cancel for one-byte elements.
        return tensor.data().iter().map(|&v| encode(dt, v).map(|c| c as u8)).collect();
    }
    pack_general(tensor, dt, reverse_endian, reverse_inner)
}

/// Unpack an accelerator byte stream into a folded tensor
///
/// # Errors
///
/// Returns [`DriverError::UnsupportedDatatype`] for unhandled bit widths and
/// [`DriverError::Precondition`] if `bytes` does not match the packed length
/// implied by `folded`.
pub fn unpack(
    bytes: &[u8],
    dt: Datatype,
    folded: &Shape,
    reverse_endian: bool,
    reverse_inner: bool,
) -> Result<Tensor> {
    let w = checked_width(dt)?;
    check_packed_len(bytes, dt, folded)?;
    if w == 8 && reverse_endian == reverse_inner {
        let data = bytes.iter().map(|&b| decode(dt, u64::from(b))).collect();
        return Tensor::new(data, folded.clone());
    }
    unpack_general(bytes, dt, folded, reverse_endian, reverse_inner)
}

fn checked_width(dt: Datatype) -> Result<usize> {
    let w = dt.bitwidth();
    if w == 0 || w > MAX_BITWIDTH {
        return Err(DriverError::unsupported_datatype(format!(
            "bit width {w} of {dt} outside supported range 1..={MAX_BITWIDTH}"
        )));
    }
    Ok(w)
}

fn check_packed_len(bytes: &[u8], dt: Datatype, folded: &Shape) -> Result<()> {
    let inner = folded.inner();
    let rows = row_count(folded)?;
    let expected = rows * packed_row_bytes(inner, dt)?;
    if bytes.len() != expected {
        return Err(DriverError::precondition(format!(
            "packed stream is {} bytes but folded shape {folded} with {dt} needs {expected}",
            bytes.len()
        )));
    }
    Ok(())
}

fn row_count(folded: &Shape) -> Result<usize> {
    let inner = folded.inner();
    if inner == 0 {
        return Err(DriverError::precondition(format!(
            "folded shape {folded} has an empty innermost dimension"
        )));
    }
    Ok(folded.total_elements() / inner)
}

fn pack_general(
    tensor: &Tensor,
    dt: Datatype,
    reverse_endian: bool,
    reverse_inner: bool,
) -> Result<Vec<u8>> {
    let w = dt.bitwidth();
    let inner = tensor.shape().inner();
    let rows = row_count(tensor.shape())?;
    let row_bytes = packed_row_bytes(inner, dt)?;
    // Concatenation is left-padded: unused pad bits sit above the first lane.
    let pad = row_bytes * 8 - inner * w;

    let mut out = vec![0u8; rows * row_bytes];
    for (r, row) in tensor.data().chunks_exact(inner).enumerate() {
        let out_row = &mut out[r * row_bytes..(r + 1) * row_bytes];
        for (i, &value) in row.iter().enumerate() {
            let lane = if reverse_inner { inner - 1 - i } else { i };
            let code = encode(dt, value)?;
            for b in 0..w {
                if (code >> (w - 1 - b)) & 1 != 0 {
                    let p = pad + lane * w + b;
                    out_row[p / 8] |= 1 << (7 - p % 8);
                }
            }
        }
        if reverse_endian {
            out_row.reverse();
        }
    }
    Ok(out)
}

fn unpack_general(
    bytes: &[u8],
    dt: Datatype,
    folded: &Shape,
    reverse_endian: bool,
    reverse_inner: bool,
) -> Result<Tensor> {
    let w = dt.bitwidth();
    let inner = folded.inner();
    let rows = row_count(folded)?;
    let row_bytes = packed_row_bytes(inner, dt)?;
    let pad = row_bytes * 8 - inner * w;

    let mut data = Vec::with_capacity(rows * inner);
    let mut row_buf = vec![0u8; row_bytes];
    for r in 0..rows {
        row_buf.copy_from_slice(&bytes[r * row_bytes..(r + 1) * row_bytes]);
        if reverse_endian {
            row_buf.reverse();
        }
        for i in 0..inner {
            let lane = if reverse_inner { inner - 1 - i } else { i };
            let mut code = 0u64;
            for b in 0..w {
                let p = pad + lane * w + b;
                let bit = (row_buf[p / 8] >> (7 - p % 8)) & 1;
                code = (code << 1) | u64::from(bit);
            }
            data.push(decode(dt, code));
        }
    }
    Tensor::new(data, folded.clone())
}

/// Encode one element as its packed bit code (two's complement for signed)
fn encode(dt: Datatype, value: i64) -> Result<u64> {
    if !dt.allowed(value) {
        return Err(DriverError::precondition(format!(
            "value {value} not representable in {dt}"
        )));
    }
    let w = dt.bitwidth();
    let code = match dt {
        Datatype::Bipolar => u64::from(value == 1),
        _ => (value as u64) & (u64::MAX >> (64 - w)),
    };
    Ok(code)
}

/// Decode one packed bit code back to an element value
fn decode(dt: Datatype, code: u64) -> i64 {
    let w = dt.bitwidth();
    match dt {
        Datatype::Bipolar => {
            if code & 1 == 1 {
                1
            } else {
                -1
            }
        }
        _ if dt.signed() => {
            // sign extend from bit w-1
            let raw = code as i64;
            if w < 64 && raw & (1 << (w - 1)) != 0 {
                raw - (1 << w)
            } else {
                raw
            }
        }
        _ => code as i64,
    }
}
