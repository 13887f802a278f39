//! End-to-end pipeline tests over the loopback device image
//!
//! The loopback image is a pass-through accelerator, so for matching input
//! and output descriptors a full `run` is an identity function on the
//! tensor data. That property exercises every host-side stage on both
//! execution protocols without hardware.

use dataflow_driver::weight_files::write_npy_u8;
use dataflow_driver::{
    load_runtime_weights, Accelerator, Datatype, DeviceImage, DriverConfig, DriverError,
    IoShapeDescriptor, LoopbackImage, Platform, Shape, Tensor,
};
use std::sync::Arc;
use tempfile::TempDir;

fn identity_descriptor(batch_placeholder: usize, elems: usize) -> IoShapeDescriptor {
    // UINT8 with normal == folded == packed: one byte per element
    let shape = Shape::from([batch_placeholder, elems]);
    IoShapeDescriptor::single_io(
        Datatype::UInt(8),
        Datatype::UInt(8),
        (shape.clone(), shape.clone(), shape.clone()),
        (shape.clone(), shape.clone(), shape),
    )
}

fn bring_up(platform: Platform, config: &DriverConfig) -> (Arc<LoopbackImage>, Accelerator) {
    let desc = identity_descriptor(1, 4);
    let image = Arc::new(LoopbackImage::for_descriptor(&desc));
    let driver = Accelerator::new(Arc::clone(&image) as Arc<dyn DeviceImage>, desc, platform, config)
        .expect("bring-up failed");
    (image, driver)
}

#[test]
fn test_run_is_identity_on_soc() {
    let (_, mut driver) = bring_up(Platform::Soc, &DriverConfig::default());
    let input = Tensor::new(vec![10, 20, 30, 40], Shape::from([1, 4])).unwrap();
    let outputs = driver.run(vec![input]).unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].data(), &[10, 20, 30, 40]);
    assert_eq!(*outputs[0].shape(), Shape::from([1, 4]));
}

#[test]
fn test_run_is_identity_on_pcie() {
    let (_, mut driver) = bring_up(Platform::Pcie, &DriverConfig::default());
    let input = Tensor::new(vec![255, 0, 1, 128], Shape::from([1, 4])).unwrap();
    let outputs = driver.run(vec![input]).unwrap();
    assert_eq!(outputs[0].data(), &[255, 0, 1, 128]);
}

#[test]
fn test_repeated_runs_reuse_buffers() {
    let (image, mut driver) = bring_up(Platform::Soc, &DriverConfig::default());
    let before = image.live_allocations();
    for round in 0..3u8 {
        let v = i64::from(round);
        let input = Tensor::new(vec![v, v + 1, v + 2, v + 3], Shape::from([1, 4])).unwrap();
        let out = driver.run(vec![input]).unwrap();
        assert_eq!(out[0].data(), &[v, v + 1, v + 2, v + 3]);
    }
    assert_eq!(image.live_allocations(), before);
}

#[test]
fn test_set_batch_size_releases_and_resizes() {
    let (image, mut driver) = bring_up(Platform::Soc, &DriverConfig::default());
    let before = image.live_allocations();
    driver.set_batch_size(8).unwrap();
    // 1 input + 1 output buffer, old ones released
    assert_eq!(image.live_allocations(), before);
    assert_eq!(driver.batch_size(), 8);
    let packed = driver.descriptor().ishape_packed(0, driver.batch_size()).unwrap();
    assert_eq!(packed.dims[0], 8, "packed shapes track the new batch size");

    let input = Tensor::from_fn(Shape::from([8, 4]), |i| (i % 251) as i64);
    let expected = input.clone();
    let out = driver.run(vec![input]).unwrap();
    assert_eq!(out[0], expected);

    assert!(matches!(
        driver.set_batch_size(0).unwrap_err(),
        DriverError::Configuration { .. }
    ));
    assert_eq!(driver.batch_size(), 8, "failed resize leaves capacity alone");
}

#[test]
fn test_partial_batch_executes_leading_samples() {
    let (_, mut driver) = bring_up(Platform::Soc, &DriverConfig::default());
    driver.set_batch_size(4).unwrap();

    let input = Tensor::from_fn(Shape::from([4, 4]), |i| i as i64 + 1);
    let folded = driver.fold_input(input, 0).unwrap();
    let packed = driver.pack_input(&folded, 0).unwrap();
    driver.copy_input_to_device(0, &packed).unwrap();

    driver.execute_on_buffers(false, Some(2)).unwrap();
    let out = driver.read_output(0).unwrap();
    // first two samples transferred, tail keeps the zero-initialized bytes
    assert_eq!(&out.data()[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(&out.data()[8..], &[0; 8]);
}

#[test]
fn test_soc_rejects_overlapping_launch() {
    let (image, mut driver) = bring_up(Platform::Soc, &DriverConfig::default());
    // directly arm the output engine so it reports busy
    let odma = image.engine("odma0").unwrap();
    odma.write_reg(0x00, 1);
    let input = Tensor::zeros(Shape::from([1, 4]));
    assert!(matches!(
        driver.run(vec![input]).unwrap_err(),
        DriverError::Precondition { .. }
    ));
    // the rejected launch wrote no engine registers
    let idma = image.engine("idma0").unwrap();
    assert_eq!(idma.read_reg(0x10), 0, "input address register untouched");
    assert_eq!(idma.read_reg(0x1C), 0, "input batch register untouched");
}

#[test]
fn test_pcie_rejects_double_launch() {
    let (_, mut driver) = bring_up(Platform::Pcie, &DriverConfig::default());
    driver.execute_on_buffers(true, None).unwrap();
    assert!(matches!(
        driver.execute_on_buffers(true, None).unwrap_err(),
        DriverError::Precondition { .. }
    ));
    driver.wait().unwrap();
    // handles consumed, a second wait has nothing to wait on
    assert!(matches!(
        driver.wait().unwrap_err(),
        DriverError::Precondition { .. }
    ));
    // and a fresh launch is accepted again
    driver.execute_on_buffers(false, None).unwrap();
}

#[test]
fn test_asynchronous_execution_on_pcie() {
    let (_, mut driver) = bring_up(Platform::Pcie, &DriverConfig::default());
    let input = Tensor::new(vec![5, 6, 7, 8], Shape::from([1, 4])).unwrap();
    let folded = driver.fold_input(input, 0).unwrap();
    let packed = driver.pack_input(&folded, 0).unwrap();
    driver.copy_input_to_device(0, &packed).unwrap();

    driver.execute_on_buffers(true, None).unwrap();
    driver.wait().unwrap();
    let out = driver.read_output(0).unwrap();
    assert_eq!(out.data(), &[5, 6, 7, 8]);
}

#[test]
fn test_external_weights_loaded_at_bring_up() {
    let dir = TempDir::new().unwrap();
    let desc = {
        let mut d = identity_descriptor(1, 4);
        d.num_external_weights = Some(1);
        d
    };
    let image = Arc::new(LoopbackImage::for_descriptor(&desc));
    image.add_weight_engine("iwdma0");
    write_npy_u8(&dir.path().join("iwdma0.npy"), &[16], &[0x5A; 16]).unwrap();

    let config = DriverConfig {
        weight_dir: Some(dir.path().to_path_buf()),
        ..DriverConfig::default()
    };
    let mut driver = Accelerator::new(image, desc, Platform::Soc, &config).unwrap();
    assert_eq!(driver.external_weights().len(), 1);
    assert_eq!(driver.external_weights()[0].name, "iwdma0");

    // weights stream on every execution without further caller involvement
    let input = Tensor::new(vec![1, 2, 3, 4], Shape::from([1, 4])).unwrap();
    let out = driver.run(vec![input]).unwrap();
    assert_eq!(out[0].data(), &[1, 2, 3, 4]);
}

#[test]
fn test_external_weight_count_mismatch_fails_bring_up() {
    let dir = TempDir::new().unwrap();
    let desc = {
        let mut d = identity_descriptor(1, 4);
        d.num_external_weights = Some(2);
        d
    };
    let image = Arc::new(LoopbackImage::for_descriptor(&desc));
    image.add_weight_engine("iwdma0");
    write_npy_u8(&dir.path().join("iwdma0.npy"), &[4], &[1, 2, 3, 4]).unwrap();

    let config = DriverConfig {
        weight_dir: Some(dir.path().to_path_buf()),
        ..DriverConfig::default()
    };
    assert!(matches!(
        Accelerator::new(image, desc, Platform::Soc, &config).unwrap_err(),
        DriverError::Configuration { .. }
    ));
}

#[test]
fn test_runtime_weights_written_and_flushed_at_bring_up() {
    let dir = TempDir::new().unwrap();
    let desc = identity_descriptor(1, 4);
    let image = Arc::new(LoopbackImage::for_descriptor(&desc));
    image.add_partition("partition_0", 8);
    std::fs::write(dir.path().join("0_0_thresholds.dat"), "deadbeef 0000002a\n").unwrap();

    let config = DriverConfig {
        weight_dir: Some(dir.path().to_path_buf()),
        ..DriverConfig::default()
    };
    let driver = Accelerator::new(
        Arc::clone(&image) as Arc<dyn DeviceImage>,
        desc,
        Platform::Soc,
        &config,
    )
    .unwrap();

    let partition = image.partition("partition_0").unwrap();
    assert_eq!(partition.read32(0), 0xDEAD_BEEF);
    assert_eq!(partition.read32(4), 0x2A);
    drop(driver);
}

#[test]
fn test_runtime_weight_loader_skips_unknown_partitions() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("3_0_weights.dat"), "00000001\n").unwrap();
    let image: Arc<dyn DeviceImage> = Arc::new(LoopbackImage::new());
    let written = load_runtime_weights(&image, dir.path(), true).unwrap();
    assert_eq!(written, 0);
}
