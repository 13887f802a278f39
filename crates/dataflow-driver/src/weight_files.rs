//! Weight file container parsing
//!
//! Two on-disk formats feed the weight loaders:
//!
//! - external weights: one NumPy `.npy` v1 file per engine, restricted to
//!   C-order `uint8` arrays (the packing flow emits external weights as raw
//!   packed bytes);
//! - runtime weights: one `.dat` file per layer named
//!   `<partition-index>_<layer-index>_*`, containing whitespace-separated
//!   hexadecimal 32-bit words.

use crate::error::{DriverError, Result};
use bytes::Bytes;
use std::path::Path;

const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";

/// Read a `.npy` file holding a C-order `uint8` tensor
///
/// Returns the array shape and its raw bytes.
///
/// # Errors
///
/// Returns [`DriverError::Io`] on read failure and
/// [`DriverError::Configuration`] for malformed headers, non-`uint8` dtypes,
/// Fortran-order arrays, or truncated payloads.
pub fn read_npy_u8(path: &Path) -> Result<(Vec<usize>, Bytes)> {
    let raw = Bytes::from(std::fs::read(path)?);
    let bad = |why: &str| {
        DriverError::configuration(format!("weight file {}: {why}", path.display()))
    };

    if raw.len() < 10 || &raw[..6] != NPY_MAGIC {
        return Err(bad("not a .npy file"));
    }
    if raw[6] != 1 {
        return Err(bad("unsupported .npy format version"));
    }
    let header_len = usize::from(u16::from_le_bytes([raw[8], raw[9]]));
    let data_start = 10 + header_len;
    if raw.len() < data_start {
        return Err(bad("truncated header"));
    }
    let header = std::str::from_utf8(&raw[10..data_start]).map_err(|_| bad("header not ASCII"))?;

    if !(header.contains("'|u1'") || header.contains("\"|u1\"")) {
        return Err(bad("external weights must be uint8 ('|u1')"));
    }
    if header.contains("True") {
        return Err(bad("Fortran-order arrays are not supported"));
    }

    let shape = parse_shape_tuple(header).ok_or_else(|| bad("cannot parse shape tuple"))?;
    let expected: usize = shape.iter().product();
    let data = raw.slice(data_start..);
    if data.len() < expected {
        return Err(bad("payload shorter than shape implies"));
    }
    Ok((shape, data.slice(..expected)))
}

/// Write a C-order `uint8` tensor as a `.npy` v1 file
///
/// Inverse of [`read_npy_u8`]; used by tests and the bench tools to stage
/// weight directories.
///
/// # Errors
///
/// Returns [`DriverError::Precondition`] if `data` does not match `shape`
/// and [`DriverError::Io`] on write failure.
pub fn write_npy_u8(path: &Path, shape: &[usize], data: &[u8]) -> Result<()> {
    if data.len() != shape.iter().product::<usize>() {
        return Err(DriverError::precondition(format!(
            "weight payload is {} bytes but shape {shape:?} holds {}",
            data.len(),
            shape.iter().product::<usize>()
        )));
    }
    let dims = shape
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    // single-element tuples need the trailing comma
    let tuple = if shape.len() == 1 { format!("({dims},)") } else { format!("({dims})") };
    let mut header = format!("{{'descr': '|u1', 'fortran_order': False, 'shape': {tuple}, }}");
    // header (incl. the 10 preamble bytes) is padded to a 64-byte boundary
    let unpadded = 10 + header.len() + 1;
    header.push_str(&" ".repeat(unpadded.next_multiple_of(64) - unpadded));
    header.push('\n');

    let mut out = Vec::with_capacity(10 + header.len() + data.len());
    out.extend_from_slice(NPY_MAGIC);
    out.extend_from_slice(&[1, 0]);
    #[allow(clippy::cast_possible_truncation)] // padded header is far below u16::MAX
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(data);
    std::fs::write(path, out)?;
    Ok(())
}

fn parse_shape_tuple(header: &str) -> Option<Vec<usize>> {
    let open = header.find('(')?;
    let close = header[open..].find(')')? + open;
    header[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>().ok())
        .collect()
}

/// Parse whitespace-separated hexadecimal 32-bit words
///
/// # Errors
///
/// Returns [`DriverError::Configuration`] for tokens that are not valid hex
/// words.
pub fn parse_hex_words(text: &str) -> Result<Vec<u32>> {
    text.split_whitespace()
        .map(|tok| {
            u32::from_str_radix(tok.trim_start_matches("0x"), 16).map_err(|_| {
                DriverError::configuration(format!("invalid hex word '{tok}' in runtime weights"))
            })
        })
        .collect()
}

/// Extract `(partition-index, layer-index)` from a runtime weight file stem
/// of the form `<partition>_<layer>_*`; `None` if the stem does not encode
/// two leading indices
#[must_use]
pub fn runtime_weight_indices(stem: &str) -> Option<(usize, usize)> {
    let mut parts = stem.split('_');
    let sdp = parts.next()?.parse().ok()?;
    let layer = parts.next()?.parse().ok()?;
    Some((sdp, layer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_npy_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("idma0.npy");
        let data: Vec<u8> = (0..24).collect();
        write_npy_u8(&path, &[4, 6], &data).unwrap();
        let (shape, back) = read_npy_u8(&path).unwrap();
        assert_eq!(shape, vec![4, 6]);
        assert_eq!(&back[..], &data[..]);
    }

    #[test]
    fn test_npy_single_dim_tuple() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("w.npy");
        write_npy_u8(&path, &[5], &[1, 2, 3, 4, 5]).unwrap();
        let (shape, _) = read_npy_u8(&path).unwrap();
        assert_eq!(shape, vec![5]);
    }

    #[test]
    fn test_npy_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.npy");
        std::fs::write(&path, b"not numpy at all").unwrap();
        assert!(matches!(
            read_npy_u8(&path).unwrap_err(),
            DriverError::Configuration { .. }
        ));
    }

    #[test]
    fn test_hex_words() {
        assert_eq!(
            parse_hex_words("deadbeef 0x10 0\n  ff").unwrap(),
            vec![0xdead_beef, 0x10, 0, 0xff]
        );
        assert!(parse_hex_words("xyzzy").is_err());
    }

    #[test]
    fn test_runtime_weight_indices() {
        assert_eq!(runtime_weight_indices("0_3_matrixvector"), Some((0, 3)));
        assert_eq!(runtime_weight_indices("2_10"), Some((2, 10)));
        assert_eq!(runtime_weight_indices("weights"), None);
        assert_eq!(runtime_weight_indices("a_b_c"), None);
    }
}
