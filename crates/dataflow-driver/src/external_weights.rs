//! External (device-memory) weight loading
//!
//! External weights are streamed into the accelerator from device memory by
//! dedicated input engines. At start-up the driver scans the weight
//! directory for one `.npy` blob per engine (filename stem = engine name),
//! copies each into a freshly allocated device buffer, flushes it, and
//! records the binding. Bindings live for the driver's lifetime.

use crate::error::{DriverError, Result};
use crate::image::{DeviceBuffer, DeviceImage, DmaEngine};
use crate::weight_files::read_npy_u8;
use std::path::Path;
use std::sync::Arc;

/// One loaded external weight: its engine, device buffer, and name
#[derive(Debug)]
pub struct ExternalWeightBinding {
    /// Engine that streams this weight into the accelerator
    pub engine: Arc<dyn DmaEngine>,
    /// Device-resident weight bytes; owned here, never reallocated
    pub buffer: Box<dyn DeviceBuffer>,
    /// Engine name (weight file stem)
    pub name: String,
}

/// Scan `dir` and bind every weight blob whose stem names a known engine
///
/// A missing directory means "no weights to load" and yields an empty list.
/// Files for engines absent from the image's engine table are skipped.
/// After scanning, the discovered count is checked against `expected`
/// (the descriptor's declared hardware external-weight count), if any.
///
/// # Errors
///
/// Returns [`DriverError::Configuration`] on a count mismatch or malformed
/// weight file, and [`DriverError::Io`] on read failures.
pub fn load_external_weights(
    image: &Arc<dyn DeviceImage>,
    dir: &Path,
    cacheable: bool,
    expected: Option<usize>,
) -> Result<Vec<ExternalWeightBinding>> {
    let mut bindings = Vec::new();
    if dir.is_dir() {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|e| e == "npy"))
            .collect();
        paths.sort();

        for path in paths {
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some(engine) = image.engine(name) else {
                tracing::debug!(name, "no engine for weight file, skipping");
                continue;
            };
            let (shape, data) = read_npy_u8(&path)?;
            let buffer = image.alloc(data.len(), cacheable)?;
            buffer.write(0, &data)?;
            buffer.flush();
            tracing::info!(name, bytes = data.len(), ?shape, "loaded external weight");
            bindings.push(ExternalWeightBinding {
                engine,
                buffer,
                name: name.to_string(),
            });
        }
    }

    if let Some(expected) = expected {
        if bindings.len() != expected {
            return Err(DriverError::configuration(format!(
                "hardware declares {expected} external weight(s) but {} were found in {} — \
                 is the weight directory pointing to the correct folder?",
                bindings.len(),
                dir.display()
            )));
        }
    }
    Ok(bindings)
}
