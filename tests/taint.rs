//! Taint memory integration tests.
//!
//! Drives the taint store through the engine the way an emulator does: stores and loads
//! from translated code, bulk range updates from device models, garbage collection at
//! safe points.

use std::sync::{Arc, Mutex};

use proptest::prelude::*;
use vmscope::{
    host::{HostEvent, RecordingHost},
    prelude::*,
    Result,
};

fn compact_engine() -> Result<Engine> {
    let config = EngineConfig::default().with_taint(TaintConfig::compact());
    let mut engine = Engine::new(config, NullHost)?;
    engine.enable_taint();
    Ok(engine)
}

#[test]
fn test_enable_store_load_disable() -> Result<()> {
    let mut engine = Engine::new(EngineConfig::for_ram(16 << 20), NullHost)?;
    assert!(engine.enable_taint());

    engine.taint_store(0x1000, 0, AccessSize::Long, 0xFF00_0000)?;
    assert_eq!(engine.taint_load(0x1000, 0, AccessSize::Byte).bits(), 0x00);
    assert_eq!(engine.taint_load(0x1003, 0, AccessSize::Byte).bits(), 0xFF);

    assert!(engine.disable_taint());
    assert!(engine.enable_taint());
    assert_eq!(engine.taint_load(0x1003, 0, AccessSize::Byte).bits(), 0x00);
    Ok(())
}

#[test]
fn test_disabled_tracking() -> Result<()> {
    let mut engine = Engine::new(EngineConfig::default(), NullHost)?;

    assert!(!engine.taint_store(0x10, 0x10, AccessSize::Word, 0xFFFF)?);
    assert!(engine.taint_load(0x10, 0x10, AccessSize::Word).is_clean());
    assert!(matches!(engine.tainted_bytes(), Err(Error::TaintDisabled)));
    assert!(matches!(
        engine.collect_taint_garbage(),
        Err(Error::TaintDisabled)
    ));
    assert!(engine.taint_usage().is_none());
    assert!(!engine.disable_taint());
    Ok(())
}

#[test]
fn test_store_straddling_ram_end() -> Result<()> {
    let mut engine = compact_engine()?;
    let written = Arc::new(Mutex::new(Vec::new()));
    let sink = written.clone();
    engine.register(CallbackKind::WriteTaintMem, None, move |_, params| {
        if let CallbackEvent::WriteTaintMem(access) = params.event {
            sink.lock().unwrap().push(access.taint.as_slice().to_vec());
        }
    })?;

    // Compact RAM is 1 MiB; only the first two bytes of this store exist
    let end = (1 << 20) - 2;
    assert!(engine.taint_store(end, 0, AccessSize::Long, 0x4433_2211)?);
    assert_eq!(engine.taint_load(end, 0, AccessSize::Long).bits(), 0x2211);
    assert_eq!(*written.lock().unwrap(), vec![vec![0x11, 0x22, 0x00, 0x00]]);
    assert_eq!(engine.tainted_bytes()?, 2);
    Ok(())
}

#[test]
fn test_store_beyond_ram_is_dropped() -> Result<()> {
    let mut engine = compact_engine()?;
    let writes = Arc::new(Mutex::new(0));
    let counter = writes.clone();
    engine.register(CallbackKind::WriteTaintMem, None, move |_, _| {
        *counter.lock().unwrap() += 1;
    })?;

    assert!(!engine.taint_store(1 << 20, 0, AccessSize::Long, 0xFFFF_FFFF)?);
    assert!(!engine.taint_store(0x20_0000, 0, AccessSize::Quad, u64::MAX)?);
    assert_eq!(*writes.lock().unwrap(), 0);
    assert!(engine.taint_load(1 << 20, 0, AccessSize::Long).is_clean());

    let usage = engine.taint_usage().ok_or(Error::TaintDisabled)?;
    assert_eq!(usage.leaf_in_use, 0);
    assert_eq!(engine.tainted_bytes()?, 0);
    Ok(())
}

#[test]
fn test_quad_access_across_leaves() -> Result<()> {
    let mut engine = compact_engine()?;
    // Compact leaves cover 64 bytes; this quad straddles two of them
    let bits = 0x0102_0304_0506_0708;
    engine.taint_store(0x3C, 0x3C, AccessSize::Quad, bits)?;

    assert_eq!(engine.taint_load(0x3C, 0x3C, AccessSize::Quad).bits(), bits);
    assert_eq!(engine.taint_load(0x40, 0x40, AccessSize::Long).bits(), 0x0102_0304);

    let usage = engine.taint_usage().ok_or(Error::TaintDisabled)?;
    assert_eq!(usage.leaf_in_use, 2);
    Ok(())
}

#[test]
fn test_taint_callback_payloads() -> Result<()> {
    let mut engine = compact_engine()?;
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = seen.clone();
    engine.register(CallbackKind::WriteTaintMem, None, move |_, params| {
        if let CallbackEvent::WriteTaintMem(access) = params.event {
            sink.lock()
                .unwrap()
                .push(("write", access.vaddr, access.taint.as_slice().to_vec()));
        }
    })?;
    let sink = seen.clone();
    engine.register(CallbackKind::ReadTaintMem, None, move |_, params| {
        if let CallbackEvent::ReadTaintMem(access) = params.event {
            sink.lock()
                .unwrap()
                .push(("read", access.vaddr, access.taint.as_slice().to_vec()));
        }
    })?;

    engine.taint_store(0x20, 0x40_1020, AccessSize::Word, 0x8000)?;
    engine.taint_load(0x20, 0x40_1020, AccessSize::Word);

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            ("write", 0x40_1020, vec![0x00, 0x80]),
            ("read", 0x40_1020, vec![0x00, 0x80]),
        ]
    );
    Ok(())
}

#[test]
fn test_gc_at_safe_point() -> Result<()> {
    let host = RecordingHost::new();
    let config = EngineConfig::default().with_taint(TaintConfig::compact().with_gc_interval(4));
    let mut engine = Engine::new(config, host.clone())?;
    engine.enable_taint();

    engine.taint_range(0x100, &[1; 8])?;
    engine.taint_store(0x200, 0, AccessSize::Byte, 1)?;
    for offset in 0..3 {
        engine.taint_store(0x200 + offset, 0, AccessSize::Byte, 0)?;
    }
    host.clear();

    let report = engine.safe_point()?.ok_or(Error::TaintDisabled)?;
    assert_eq!(report.leaves_freed, 1);
    assert_eq!(report.middles_freed, 0);
    assert_eq!(host.events(), vec![HostEvent::StopVm, HostEvent::StartVm]);

    let mut out = [0u8; 8];
    engine.check_taint_range(0x100, &mut out)?;
    assert_eq!(out, [1; 8]);
    Ok(())
}

#[test]
fn test_leaf_pool_limit() -> Result<()> {
    let taint = TaintConfig::compact().with_leaf_pool_limit(1);
    let mut engine = Engine::new(EngineConfig::default().with_taint(taint), NullHost)?;
    engine.enable_taint();

    engine.taint_store(0x00, 0, AccessSize::Byte, 1)?;
    assert!(matches!(
        engine.taint_store(0x100, 0, AccessSize::Byte, 1),
        Err(Error::PoolExhausted { pool: "leaf", .. })
    ));

    // Clearing and collecting frees the leaf for reuse
    engine.taint_store(0x00, 0, AccessSize::Byte, 0)?;
    engine.collect_taint_garbage()?;
    engine.taint_store(0x100, 0, AccessSize::Byte, 1)?;
    assert_eq!(engine.tainted_bytes()?, 1);
    Ok(())
}

#[test]
fn test_usage_display() -> Result<()> {
    let mut engine = Engine::new(EngineConfig::for_ram(16 << 20), NullHost)?;
    engine.enable_taint();
    engine.taint_store(0x1000, 0, AccessSize::Byte, 1)?;

    let usage = engine.taint_usage().ok_or(Error::TaintDisabled)?;
    assert!(usage.to_string().starts_with("16M RAM: 1 mid nodes, 1 leaf nodes"));
    Ok(())
}

#[test]
fn test_nic_buffer() -> Result<()> {
    let mut engine = compact_engine()?;
    engine.set_nic_tainting(true)?;

    let nic = engine.nic_taint_mut();
    nic.write(0x100, &[0xFF; 4])?;
    let mut out = [0u8; 6];
    nic.read(0xFF, &mut out)?;
    assert_eq!(out, [0, 0xFF, 0xFF, 0xFF, 0xFF, 0]);
    assert!(matches!(
        nic.write(32 * 1024 - 1, &[1, 1]),
        Err(Error::OutOfBounds { .. })
    ));

    assert!(engine.disable_taint());
    let mut out = [0u8; 4];
    engine.nic_taint_mut().read(0x100, &mut out)?;
    assert_eq!(out, [0; 4]);
    Ok(())
}

fn access_size() -> impl Strategy<Value = AccessSize> {
    prop_oneof![
        Just(AccessSize::Byte),
        Just(AccessSize::Word),
        Just(AccessSize::Long),
        Just(AccessSize::Quad),
    ]
}

proptest! {
    #[test]
    fn prop_unwritten_memory_is_clean(addr in 0u32..(1 << 20), size in access_size()) {
        let mut engine = compact_engine().unwrap();
        let reads = Arc::new(Mutex::new(0));
        let counter = reads.clone();
        engine
            .register(CallbackKind::ReadTaintMem, None, move |_, _| *counter.lock().unwrap() += 1)
            .unwrap();

        prop_assert!(engine.taint_load(addr, addr, size).is_clean());
        prop_assert_eq!(*reads.lock().unwrap(), 0);
    }

    #[test]
    fn prop_write_read_agreement(
        addr in 0u32..(1 << 20) - 8,
        size in access_size(),
        bits in any::<u64>(),
    ) {
        let mut engine = compact_engine().unwrap();
        let reads = Arc::new(Mutex::new(0));
        let counter = reads.clone();
        engine
            .register(CallbackKind::ReadTaintMem, None, move |_, _| *counter.lock().unwrap() += 1)
            .unwrap();

        let expected = bits & size.mask();
        engine.taint_store(addr, addr, size, bits).unwrap();
        prop_assert_eq!(engine.taint_load(addr, addr, size).bits(), expected);
        prop_assert_eq!(*reads.lock().unwrap(), usize::from(expected != 0));
    }

    #[test]
    fn prop_gc_preserves_taint(writes in prop::collection::vec((0u32..4096, any::<u8>()), 1..64)) {
        let mut engine = compact_engine().unwrap();
        for (addr, taint) in &writes {
            engine.taint_store(*addr, 0, AccessSize::Byte, u64::from(*taint)).unwrap();
        }

        let mut before = vec![0u8; 4096];
        engine.check_taint_range(0, &mut before).unwrap();
        let usage_before = engine.taint_usage().unwrap();

        engine.collect_taint_garbage().unwrap();

        let mut after = vec![0u8; 4096];
        engine.check_taint_range(0, &mut after).unwrap();
        let usage_after = engine.taint_usage().unwrap();

        prop_assert_eq!(before, after);
        prop_assert!(usage_after.leaf_in_use <= usage_before.leaf_in_use);
        prop_assert!(usage_after.middle_in_use <= usage_before.middle_in_use);
    }
}
