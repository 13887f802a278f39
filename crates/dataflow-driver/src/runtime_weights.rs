//! Runtime-writable weight loading
//!
//! Runtime weights live in accelerator-internal register space and are
//! written through a partition's memory-mapped interface rather than
//! streamed. One `.dat` file per layer, stem `<partition>_<layer>_*`,
//! content hexadecimal 32-bit words written at offset 0. Written weights can
//! be read back and verified; a mismatch means the hardware write or the
//! readback path is broken and must abort rather than proceed with
//! unverified state. The caller runs one dummy execution afterwards to push
//! stale values out of the weight-streaming buffers.

use crate::error::{DriverError, Result};
use crate::image::{DeviceImage, RegisterSpace};
use crate::weight_files::{parse_hex_words, runtime_weight_indices};
use std::path::Path;
use std::sync::Arc;

/// Write a word sequence at offset 0 and optionally verify it by readback
///
/// # Errors
///
/// Returns [`DriverError::DataIntegrity`] if the readback differs from what
/// was written.
pub fn write_verified(
    space: &dyn RegisterSpace,
    words: &[u32],
    verify: bool,
    name: &str,
) -> Result<()> {
    space.write_words(0, words);
    if verify {
        let readback = space.read_words(0, words.len());
        if readback != words {
            let first_bad = words
                .iter()
                .zip(&readback)
                .position(|(a, b)| a != b)
                .unwrap_or(0);
            return Err(DriverError::data_integrity(format!(
                "runtime weight readback mismatch in {name} at word {first_bad}"
            )));
        }
    }
    Ok(())
}

/// Scan `dir` and write every runtime weight file to its partition
///
/// A missing directory means "no weights to load". Files whose derived
/// partition name is absent from the image's partition table are skipped.
/// Returns the number of layers written; the caller must flush the
/// accelerator with a dummy execution when that count is nonzero.
///
/// # Errors
///
/// Returns [`DriverError::DataIntegrity`] on a verification mismatch,
/// [`DriverError::Configuration`] on malformed files, and
/// [`DriverError::Io`] on read failures.
pub fn load_runtime_weights(
    image: &Arc<dyn DeviceImage>,
    dir: &Path,
    verify: bool,
) -> Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|e| e == "dat"))
        .collect();
    paths.sort();

    let mut written = 0;
    for path in paths {
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some((sdp, layer)) = runtime_weight_indices(stem) else {
            tracing::warn!(stem, "runtime weight file does not encode partition/layer indices");
            continue;
        };
        let partition_name = format!("partition_{sdp}");
        let Some(space) = image.partition(&partition_name) else {
            tracing::debug!(partition_name, "no such partition, skipping");
            continue;
        };
        let words = parse_hex_words(&std::fs::read_to_string(&path)?)?;
        write_verified(space.as_ref(), &words, verify, stem)?;
        tracing::info!(partition_name, layer, words = words.len(), "wrote runtime weights");
        written += 1;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackImage;
    use tempfile::TempDir;

    /// Register space whose readback corrupts one word, for integrity tests
    #[derive(Debug)]
    struct CorruptingSpace {
        words: std::sync::Mutex<Vec<u32>>,
    }

    impl RegisterSpace for CorruptingSpace {
        fn read32(&self, offset: usize) -> u32 {
            let stored = self.words.lock().unwrap()[offset / 4];
            if offset == 4 {
                stored ^ 1
            } else {
                stored
            }
        }

        fn write32(&self, offset: usize, value: u32) {
            self.words.lock().unwrap()[offset / 4] = value;
        }
    }

    #[test]
    fn test_faithful_readback_verifies() {
        let image = LoopbackImage::new();
        image.add_partition("partition_0", 64);
        let space = image.partition("partition_0").unwrap();
        write_verified(space.as_ref(), &[0xdead_beef, 0x1234], true, "0_0_test").unwrap();
    }

    #[test]
    fn test_corrupted_readback_is_data_integrity_error() {
        let space = CorruptingSpace {
            words: std::sync::Mutex::new(vec![0; 8]),
        };
        let err = write_verified(&space, &[1, 2, 3], true, "0_0_test").unwrap_err();
        assert!(matches!(err, DriverError::DataIntegrity { .. }));
        // without verification the same write succeeds
        write_verified(&space, &[1, 2, 3], false, "0_0_test").unwrap();
    }

    #[test]
    fn test_weights_longer_than_partition_fail_verification() {
        let image: Arc<dyn DeviceImage> = {
            let img = LoopbackImage::new();
            img.add_partition("partition_0", 2);
            Arc::new(img)
        };
        let dir = TempDir::new().unwrap();
        // three words into a two-word partition: the dropped write must
        // surface as a verification mismatch, not a crash
        std::fs::write(dir.path().join("0_0_layer.dat"), "11 22 33").unwrap();
        let err = load_runtime_weights(&image, dir.path(), true).unwrap_err();
        assert!(matches!(err, DriverError::DataIntegrity { .. }));
    }

    #[test]
    fn test_directory_scan_writes_matching_partitions() {
        let image: Arc<dyn DeviceImage> = {
            let img = LoopbackImage::new();
            img.add_partition("partition_0", 64);
            Arc::new(img)
        };
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("0_1_layer.dat"), "cafe 42").unwrap();
        // partition_7 does not exist, file is skipped
        std::fs::write(dir.path().join("7_0_layer.dat"), "ff").unwrap();
        // non-.dat files are ignored
        std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();

        let written = load_runtime_weights(&image, dir.path(), true).unwrap();
        assert_eq!(written, 1);
        let space = image.partition("partition_0").unwrap();
        assert_eq!(space.read_words(0, 2), vec![0xcafe, 0x42]);
    }

    #[test]
    fn test_missing_directory_writes_nothing() {
        let image: Arc<dyn DeviceImage> = Arc::new(LoopbackImage::new());
        let written =
            load_runtime_weights(&image, Path::new("/nonexistent/weights"), true).unwrap();
        assert_eq!(written, 0);
    }
}
