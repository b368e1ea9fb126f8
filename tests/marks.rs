//! Address mark index integration tests.
//!
//! Covers the public mark API on its own and through the engine: round trips across
//! block and page boundaries, eager reclamation and payloads.

use proptest::prelude::*;
use vmscope::{marks::MarkIndex, prelude::*, Result};

fn masked(bitmap: u64, size: usize) -> u64 {
    if size >= 64 {
        bitmap
    } else {
        bitmap & ((1u64 << size) - 1)
    }
}

#[test]
fn test_marks_through_engine() -> Result<()> {
    let mut engine = Engine::new(EngineConfig::default(), NullHost)?;

    engine.set_mark(0x40_1000, 4, 0b0110)?;
    assert_eq!(engine.check_mark(0x40_1000, 4)?, 0b0110);
    assert_eq!(engine.check_mark(0x40_1001, 1)?, 1);
    assert_eq!(engine.marks().allocated_entries(), 1);

    engine.set_mark(0x40_1000, 4, 0)?;
    assert_eq!(engine.marks().allocated_pages(), 0);
    Ok(())
}

#[test]
fn test_span_limit() {
    let mut marks = MarkIndex::new();
    assert!(matches!(
        marks.set_mark(0x1000, 65, u64::MAX),
        Err(Error::MarkSpanTooLarge(65))
    ));
    assert!(matches!(
        marks.check_mark(0x1000, 65),
        Err(Error::MarkSpanTooLarge(65))
    ));
    assert_eq!(marks.allocated_pages(), 0);
}

#[test]
fn test_partial_overwrite_keeps_neighbours() -> Result<()> {
    let mut marks = MarkIndex::new();
    marks.set_mark(0x2000, 16, 0xFFFF)?;
    marks.set_mark(0x2004, 4, 0b0101)?;

    assert_eq!(marks.check_mark(0x2000, 16)?, 0xFF5F);
    Ok(())
}

#[test]
fn test_payloads_follow_their_bytes() -> Result<()> {
    let mut marks = MarkIndex::new();
    marks.set_mark(0x3000, 8, 0b1000_0001)?;
    marks.set_mark_payload(0x3007, 0xAAAA)?;
    assert_eq!(marks.mark_payload(0x3000), Some(0));
    assert_eq!(marks.mark_payload(0x3007), Some(0xAAAA));

    // A new mark in between shifts ranks but not payloads
    marks.set_mark(0x3003, 1, 1)?;
    assert_eq!(marks.mark_payload(0x3003), Some(0));
    assert_eq!(marks.mark_payload(0x3007), Some(0xAAAA));

    marks.set_mark(0x3007, 1, 0)?;
    assert_eq!(marks.mark_payload(0x3007), None);
    assert!(matches!(
        marks.set_mark_payload(0x3007, 1),
        Err(Error::NotMarked(0x3007))
    ));
    Ok(())
}

#[test]
fn test_clear_marks_releases_everything() -> Result<()> {
    let mut marks = MarkIndex::new();
    for page in 0..4u32 {
        marks.set_mark(0x10_0000 + page * 0x1000 + 0x3C, 8, 0xFF)?;
    }
    assert_eq!(marks.allocated_pages(), 4);
    assert_eq!(marks.allocated_entries(), 8);

    marks.clear_marks(0x10_0000, 0x4000);
    assert_eq!(marks.allocated_pages(), 0);
    assert_eq!(marks.allocated_entries(), 0);
    Ok(())
}

proptest! {
    #[test]
    fn prop_round_trip(addr in 0u32..=u32::MAX - 64, size in 1usize..=64, bitmap in any::<u64>()) {
        let mut marks = MarkIndex::new();
        marks.set_mark(addr, size, bitmap).unwrap();
        prop_assert_eq!(marks.check_mark(addr, size).unwrap(), masked(bitmap, size));
    }

    #[test]
    fn prop_zero_allocates_nothing(addr in any::<u32>(), size in 0usize..=64) {
        let mut marks = MarkIndex::new();
        marks.set_mark(addr, size, 0).unwrap();
        prop_assert_eq!(marks.allocated_pages(), 0);
        prop_assert_eq!(marks.allocated_entries(), 0);
    }

    #[test]
    fn prop_set_then_clear_releases(
        addr in 0u32..=u32::MAX - 64,
        size in 1usize..=64,
        bitmap in any::<u64>(),
    ) {
        let mut marks = MarkIndex::new();
        marks.set_mark(addr, size, bitmap).unwrap();
        marks.set_mark(addr, size, 0).unwrap();
        prop_assert_eq!(marks.check_mark(addr, size).unwrap(), 0);
        prop_assert_eq!(marks.allocated_entries(), 0);
    }
}
