//! In-process loopback device image
//!
//! Implements the [`DeviceImage`] capability surface over plain host memory
//! with a pass-through accelerator: bytes streamed in on an input channel
//! appear verbatim on the paired output channel. Both execution protocols
//! are modeled — the register file with idle/done status bits for the
//! polled `soc` variant and asynchronous start/handle completion for the
//! `pcie` variant — so the whole driver pipeline runs without hardware.
//! This is what CI and the bench binaries drive.

use crate::error::{DriverError, Result};
use crate::exec::regs;
use crate::image::{DeviceBuffer, DeviceImage, DmaEngine, RegisterSpace, TransferHandle};
use crate::shapes::IoShapeDescriptor;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineRole {
    /// Source engine feeding channel `n`
    Input(usize),
    /// Drain engine of channel `n`
    Output(usize),
    /// External-weight streamer; data is consumed by the (simulated) fabric
    Weight,
}

#[derive(Debug)]
struct EngineState {
    role: EngineRole,
    addr: u32,
    addr_hi: u32,
    batch: u32,
    status: u32,
    /// Polled protocol: output engine armed with (address, batch)
    armed: Option<(u64, u32)>,
    /// Handle protocol: input engine started with (address, byte count)
    pending_src: Option<(u64, usize)>,
}

impl EngineState {
    fn new(role: EngineRole) -> Self {
        Self {
            role,
            addr: 0,
            addr_hi: 0,
            batch: 0,
            status: regs::CTRL_IDLE,
            armed: None,
            pending_src: None,
        }
    }

    fn device_address(&self) -> u64 {
        u64::from(self.addr_hi) << 32 | u64::from(self.addr)
    }
}

#[derive(Debug)]
struct Channel {
    input: String,
    output: String,
    in_sample_bytes: usize,
    out_sample_bytes: usize,
}

/// Shared state behind every engine and buffer handle
#[derive(Debug)]
struct Fabric {
    memory: HashMap<u64, Vec<u8>>,
    next_addr: u64,
    engines: HashMap<String, EngineState>,
    channels: Vec<Channel>,
    partitions: HashMap<String, Arc<LoopbackPartition>>,
    clock_mhz: f64,
}

impl Fabric {
    fn alloc(&mut self, len: usize) -> u64 {
        let addr = self.next_addr;
        // 64-byte aligned, monotonically increasing: allocations never alias
        self.next_addr += (len.max(1) as u64).next_multiple_of(64);
        self.memory.insert(addr, vec![0u8; len]);
        addr
    }

    /// Copy `len` bytes between two device allocations
    fn copy(&mut self, src: u64, dst: u64, len: usize) {
        let Some(data) = self.memory.get(&src).map(|m| m[..len.min(m.len())].to_vec()) else {
            return;
        };
        if let Some(out) = self.memory.get_mut(&dst) {
            let n = data.len().min(out.len());
            out[..n].copy_from_slice(&data[..n]);
        }
    }

    /// Polled-protocol start trigger (CTRL start bit written)
    fn trigger(&mut self, name: &str) {
        let Some(state) = self.engines.get_mut(name) else {
            return;
        };
        let role = state.role;
        match role {
            EngineRole::Output(_) => {
                state.armed = Some((state.device_address(), state.batch));
                state.status = 0;
            }
            EngineRole::Weight => {
                state.status = regs::CTRL_DONE | regs::CTRL_IDLE;
            }
            EngineRole::Input(ch) => {
                let src = state.device_address();
                let in_batch = state.batch;
                state.status = regs::CTRL_DONE | regs::CTRL_IDLE;
                let (output, in_sample, out_sample) = {
                    let c = &self.channels[ch];
                    (c.output.clone(), c.in_sample_bytes, c.out_sample_bytes)
                };
                let armed = self
                    .engines
                    .get_mut(&output)
                    .and_then(|o| o.armed.take());
                if let Some((dst, out_batch)) = armed {
                    let k = in_batch.min(out_batch) as usize;
                    self.copy(src, dst, (k * in_sample).min(k * out_sample));
                    if let Some(o) = self.engines.get_mut(&output) {
                        o.status = regs::CTRL_DONE | regs::CTRL_IDLE;
                    }
                }
                // with no armed drain the stream is dropped, as on hardware
            }
        }
    }

    /// Handle-protocol asynchronous start
    fn start_async(&mut self, name: &str, addr: u64, batch_size: usize) -> Result<()> {
        let Some(state) = self.engines.get_mut(name) else {
            return Err(DriverError::engine_not_found(name));
        };
        match state.role {
            EngineRole::Input(ch) => {
                let bytes = batch_size * self.channels[ch].in_sample_bytes;
                state.pending_src = Some((addr, bytes));
            }
            EngineRole::Weight => {}
            EngineRole::Output(ch) => {
                let input = self.channels[ch].input.clone();
                let out_bytes = batch_size * self.channels[ch].out_sample_bytes;
                let src = self
                    .engines
                    .get_mut(&input)
                    .and_then(|i| i.pending_src.take());
                if let Some((saddr, sbytes)) = src {
                    self.copy(saddr, addr, sbytes.min(out_bytes));
                }
            }
        }
        Ok(())
    }
}

/// Loopback pass-through device image for tests, CI, and benchmarks
#[derive(Debug)]
pub struct LoopbackImage {
    fabric: Arc<Mutex<Fabric>>,
}

impl Default for LoopbackImage {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackImage {
    /// Create an empty image (no engines, no partitions, 100 MHz clock)
    #[must_use]
    pub fn new() -> Self {
        Self {
            fabric: Arc::new(Mutex::new(Fabric {
                memory: HashMap::new(),
                next_addr: 0x1000,
                engines: HashMap::new(),
                channels: Vec::new(),
                partitions: HashMap::new(),
                clock_mhz: 100.0,
            })),
        }
    }

    /// Image wired for a descriptor: input engine `i` is paired with output
    /// engine `i`, with per-sample byte counts taken from the packed shapes
    #[must_use]
    pub fn for_descriptor(desc: &IoShapeDescriptor) -> Self {
        let image = Self::new();
        let channels = desc.num_inputs().min(desc.num_outputs());
        for i in 0..channels {
            image.add_channel(
                &desc.input_dma_names[i],
                &desc.output_dma_names[i],
                desc.ishape_packed[i].with_batch(1).total_elements(),
                desc.oshape_packed[i].with_batch(1).total_elements(),
            );
        }
        image
    }

    fn lock(&self) -> MutexGuard<'_, Fabric> {
        self.fabric.lock().expect("loopback fabric lock poisoned")
    }

    /// Add a pass-through channel between a named input and output engine
    pub fn add_channel(
        &self,
        input: &str,
        output: &str,
        in_sample_bytes: usize,
        out_sample_bytes: usize,
    ) {
        let mut fabric = self.lock();
        let ch = fabric.channels.len();
        fabric
            .engines
            .insert(input.to_string(), EngineState::new(EngineRole::Input(ch)));
        fabric
            .engines
            .insert(output.to_string(), EngineState::new(EngineRole::Output(ch)));
        fabric.channels.push(Channel {
            input: input.to_string(),
            output: output.to_string(),
            in_sample_bytes,
            out_sample_bytes,
        });
    }

    /// Add an external-weight streamer engine
    pub fn add_weight_engine(&self, name: &str) {
        self.lock()
            .engines
            .insert(name.to_string(), EngineState::new(EngineRole::Weight));
    }

    /// Add a register partition of `words` 32-bit registers
    pub fn add_partition(&self, name: &str, words: usize) {
        self.lock().partitions.insert(
            name.to_string(),
            Arc::new(LoopbackPartition {
                words: Mutex::new(vec![0u32; words]),
            }),
        );
    }

    /// Number of live device allocations (buffer leak checks in tests)
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.lock().memory.len()
    }
}

impl DeviceImage for LoopbackImage {
    fn engine(&self, name: &str) -> Option<Arc<dyn DmaEngine>> {
        if !self.lock().engines.contains_key(name) {
            return None;
        }
        Some(Arc::new(LoopbackEngine {
            name: name.to_string(),
            fabric: Arc::clone(&self.fabric),
        }))
    }

    fn partition(&self, name: &str) -> Option<Arc<dyn RegisterSpace>> {
        self.lock()
            .partitions
            .get(name)
            .map(|p| Arc::clone(p) as Arc<dyn RegisterSpace>)
    }

    fn alloc(&self, len: usize, cacheable: bool) -> Result<Box<dyn DeviceBuffer>> {
        let addr = self.lock().alloc(len);
        Ok(Box::new(LoopbackBuffer {
            addr,
            len,
            cacheable,
            fabric: Arc::clone(&self.fabric),
        }))
    }

    fn request_clock_mhz(&self, mhz: f64) -> Result<()> {
        self.lock().clock_mhz = mhz;
        Ok(())
    }

    fn clock_mhz(&self) -> f64 {
        self.lock().clock_mhz
    }
}

#[derive(Debug)]
struct LoopbackEngine {
    name: String,
    fabric: Arc<Mutex<Fabric>>,
}

impl LoopbackEngine {
    fn lock(&self) -> MutexGuard<'_, Fabric> {
        self.fabric.lock().expect("loopback fabric lock poisoned")
    }
}

impl DmaEngine for LoopbackEngine {
    fn read_reg(&self, offset: usize) -> u32 {
        let fabric = self.lock();
        let Some(state) = fabric.engines.get(&self.name) else {
            return 0;
        };
        match offset {
            regs::CTRL => state.status,
            regs::ADDR => state.addr,
            regs::ADDR_HI => state.addr_hi,
            regs::BATCH => state.batch,
            _ => 0,
        }
    }

    fn write_reg(&self, offset: usize, value: u32) {
        let mut fabric = self.lock();
        match offset {
            regs::ADDR => {
                if let Some(state) = fabric.engines.get_mut(&self.name) {
                    state.addr = value;
                }
            }
            regs::ADDR_HI => {
                if let Some(state) = fabric.engines.get_mut(&self.name) {
                    state.addr_hi = value;
                }
            }
            regs::BATCH => {
                if let Some(state) = fabric.engines.get_mut(&self.name) {
                    state.batch = value;
                }
            }
            regs::CTRL if value & regs::CTRL_START != 0 => fabric.trigger(&self.name),
            _ => {}
        }
    }

    fn start(
        &self,
        buffer: &dyn DeviceBuffer,
        batch_size: usize,
    ) -> Result<Box<dyn TransferHandle>> {
        self.lock()
            .start_async(&self.name, buffer.device_address(), batch_size)?;
        Ok(Box::new(LoopbackTransfer))
    }
}

/// Loopback transfers complete synchronously at start; wait is trivial
#[derive(Debug)]
struct LoopbackTransfer;

impl TransferHandle for LoopbackTransfer {
    fn wait(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct LoopbackPartition {
    words: Mutex<Vec<u32>>,
}

// Out-of-range accesses behave like real fabric address decoding: writes
// are dropped, reads return zero. Verification then reports the mismatch
// instead of the simulation panicking.
impl RegisterSpace for LoopbackPartition {
    fn read32(&self, offset: usize) -> u32 {
        let words = self.words.lock().expect("partition lock poisoned");
        words.get(offset / 4).copied().unwrap_or(0)
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut words = self.words.lock().expect("partition lock poisoned");
        if let Some(slot) = words.get_mut(offset / 4) {
            *slot = value;
        }
    }
}

#[derive(Debug)]
struct LoopbackBuffer {
    addr: u64,
    len: usize,
    cacheable: bool,
    fabric: Arc<Mutex<Fabric>>,
}

impl DeviceBuffer for LoopbackBuffer {
    fn len(&self) -> usize {
        self.len
    }

    fn device_address(&self) -> u64 {
        self.addr
    }

    fn cacheable(&self) -> bool {
        self.cacheable
    }

    fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        let mut fabric = self.fabric.lock().expect("loopback fabric lock poisoned");
        let mem = fabric
            .memory
            .get_mut(&self.addr)
            .ok_or_else(|| DriverError::precondition("buffer used after release"))?;
        if offset + data.len() > mem.len() {
            return Err(DriverError::precondition(format!(
                "write of {} bytes at offset {offset} exceeds buffer of {}",
                data.len(),
                mem.len()
            )));
        }
        mem[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let fabric = self.fabric.lock().expect("loopback fabric lock poisoned");
        let mem = fabric
            .memory
            .get(&self.addr)
            .ok_or_else(|| DriverError::precondition("buffer used after release"))?;
        if offset + out.len() > mem.len() {
            return Err(DriverError::precondition(format!(
                "read of {} bytes at offset {offset} exceeds buffer of {}",
                out.len(),
                mem.len()
            )));
        }
        out.copy_from_slice(&mem[offset..offset + out.len()]);
        Ok(())
    }

    // Host memory is coherent; sync operations are no-ops.
    fn flush(&self) {}

    fn invalidate(&self) {}
}

impl Drop for LoopbackBuffer {
    fn drop(&mut self) {
        if let Ok(mut fabric) = self.fabric.lock() {
            fabric.memory.remove(&self.addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_image() -> LoopbackImage {
        let image = LoopbackImage::new();
        image.add_channel("idma0", "odma0", 4, 4);
        image
    }

    #[test]
    fn test_polled_passthrough_copies_input_to_output() {
        let image = channel_image();
        let ibuf = image.alloc(8, true).unwrap();
        let obuf = image.alloc(8, true).unwrap();
        ibuf.write(0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        let idma = image.engine("idma0").unwrap();
        let odma = image.engine("odma0").unwrap();
        assert_ne!(odma.read_reg(regs::CTRL) & regs::CTRL_IDLE, 0);

        #[allow(clippy::cast_possible_truncation)]
        {
            odma.write_reg(regs::ADDR, obuf.device_address() as u32);
            odma.write_reg(regs::BATCH, 2);
            odma.write_reg(regs::CTRL, regs::CTRL_START);
            idma.write_reg(regs::ADDR, ibuf.device_address() as u32);
            idma.write_reg(regs::BATCH, 2);
            idma.write_reg(regs::CTRL, regs::CTRL_START);
        }

        assert_ne!(odma.read_reg(regs::CTRL) & regs::CTRL_DONE, 0);
        let mut out = [0u8; 8];
        obuf.read(0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_partial_batch_leaves_tail_untouched() {
        // capacity 4 samples of 4 bytes, transfer only k=1
        let image = channel_image();
        let ibuf = image.alloc(16, true).unwrap();
        let obuf = image.alloc(16, true).unwrap();
        ibuf.write(0, &[7u8; 16]).unwrap();
        obuf.write(0, &[0xAA; 16]).unwrap();

        let idma = image.engine("idma0").unwrap();
        let odma = image.engine("odma0").unwrap();
        #[allow(clippy::cast_possible_truncation)]
        {
            odma.write_reg(regs::ADDR, obuf.device_address() as u32);
            odma.write_reg(regs::BATCH, 1);
            odma.write_reg(regs::CTRL, regs::CTRL_START);
            idma.write_reg(regs::ADDR, ibuf.device_address() as u32);
            idma.write_reg(regs::BATCH, 1);
            idma.write_reg(regs::CTRL, regs::CTRL_START);
        }

        let mut out = [0u8; 16];
        obuf.read(0, &mut out).unwrap();
        assert_eq!(&out[..4], &[7u8; 4], "first sample transferred");
        assert_eq!(&out[4..], &[0xAA; 12], "samples beyond k untouched");
    }

    #[test]
    fn test_handle_protocol_passthrough() {
        let image = channel_image();
        let ibuf = image.alloc(8, false).unwrap();
        let obuf = image.alloc(8, false).unwrap();
        ibuf.write(0, &[9, 8, 7, 6, 5, 4, 3, 2]).unwrap();

        let idma = image.engine("idma0").unwrap();
        let odma = image.engine("odma0").unwrap();
        drop(idma.start(ibuf.as_ref(), 2).unwrap());
        let handle = odma.start(obuf.as_ref(), 2).unwrap();
        handle.wait().unwrap();

        let mut out = [0u8; 8];
        obuf.read(0, &mut out).unwrap();
        assert_eq!(out, [9, 8, 7, 6, 5, 4, 3, 2]);
    }

    #[test]
    fn test_buffers_release_on_drop() {
        let image = channel_image();
        let a = image.alloc(8, true).unwrap();
        let b = image.alloc(8, true).unwrap();
        assert_ne!(a.device_address(), b.device_address());
        assert_eq!(image.live_allocations(), 2);
        drop(a);
        drop(b);
        assert_eq!(image.live_allocations(), 0);
    }

    #[test]
    fn test_unknown_engine_resolves_to_none() {
        let image = channel_image();
        assert!(image.engine("idma7").is_none());
        assert!(image.partition("partition_0").is_none());
    }
}
