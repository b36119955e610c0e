//! Corruption detection in allocator structures
//!
//! Every test runs with `CorruptionPolicy::Propagate` so the damage comes back
//! as an error instead of aborting the test process.

use std::sync::Arc;
use tablespace_rs::{
    CorruptionPolicy, Direction, MemoryStorage, RedoLog, SegmentRef, SpaceConfig, SpaceError,
    Tablespace,
};

/// Descriptor array start on page 0 and the state field within a record
const XDES_ARR_OFFSET: usize = 150;
const XDES_SIZE: usize = 40;
const XDES_STATE: usize = 20;
/// Size field of the tablespace header
const FSP_SIZE_OFFSET: usize = 38 + 8;

fn config(verify_checksums: bool) -> SpaceConfig {
    SpaceConfig {
        page_size: 4096,
        initial_size: 1024,
        autoextend: false,
        verify_checksums,
        on_corruption: CorruptionPolicy::Propagate,
        ..Default::default()
    }
}

/// Flushed image of a fresh tablespace
fn clean_image() -> Vec<u8> {
    let storage = Arc::new(MemoryStorage::new(4096));
    let space = Tablespace::create(config(true), storage.clone(), Arc::new(RedoLog::in_memory()))
        .unwrap();
    space.flush().unwrap();
    storage.image()
}

fn open_image(image: Vec<u8>, verify_checksums: bool) -> Result<Tablespace, SpaceError> {
    Tablespace::open(
        config(verify_checksums),
        Arc::new(MemoryStorage::from_image(4096, image)),
        Arc::new(RedoLog::in_memory()),
    )
}

fn assert_corruption<T: std::fmt::Debug>(result: Result<T, SpaceError>) {
    match result {
        Err(e) => assert!(e.is_corruption(), "expected corruption, got {:?}", e),
        Ok(v) => panic!("expected corruption, got {:?}", v),
    }
}

#[test]
fn test_double_free_of_fragment_page() {
    let space = Tablespace::create_in_memory(config(true)).unwrap();
    let page = space.alloc_page(0).unwrap().unwrap();
    space.free_page(page).unwrap();

    assert_corruption(space.free_page(page));
    assert!(space.validate().unwrap().is_ok());
}

#[test]
fn test_freeing_descriptor_page() {
    let space = Tablespace::create_in_memory(config(true)).unwrap();
    assert_corruption(space.free_page(0));
    assert_corruption(space.free_page(1));
}

#[test]
fn test_freeing_page_owned_by_other_segment() {
    let space = Tablespace::create_in_memory(config(true)).unwrap();
    let a = space.create_segment(None, 38).unwrap().unwrap();
    let b = space.create_segment(None, 38).unwrap().unwrap();
    for _ in 0..40 {
        space.alloc_segment_page(a, 0, Direction::NoDir).unwrap().unwrap();
    }
    let info = space.segment_info(a).unwrap();
    let extent_page = info.not_full[0] + 1;

    assert_corruption(space.free_segment_page(b, extent_page));
    assert_corruption(space.free_segment_page(b, info.frag_pages[3]));

    // Nothing was changed by the rejected calls
    assert_eq!(space.segment_info(a).unwrap(), info);
    assert!(space.validate().unwrap().is_ok());
}

#[test]
fn test_unknown_extent_state() {
    let mut image = clean_image();
    let state = XDES_ARR_OFFSET + XDES_SIZE + XDES_STATE;
    image[state..state + 4].copy_from_slice(&99u32.to_be_bytes());

    let space = open_image(image, false).unwrap();
    assert_corruption(space.describe_extent(64));

    let report = space.validate().unwrap();
    assert!(!report.is_ok());
}

#[test]
fn test_checksum_mismatch_on_open() {
    let mut image = clean_image();
    image[3000] ^= 0xFF;

    let err = open_image(image, true).err().unwrap();
    assert!(matches!(err, SpaceError::ChecksumMismatch { page_no: 0 }));
    assert!(err.is_corruption());
}

#[test]
fn test_header_size_beyond_storage() {
    let mut image = clean_image();
    image[FSP_SIZE_OFFSET..FSP_SIZE_OFFSET + 4].copy_from_slice(&10_000u32.to_be_bytes());

    assert_corruption(open_image(image, false).map(|_| ()));
}

#[test]
fn test_segment_header_with_bad_offset() {
    let space = Tablespace::create_in_memory(config(true)).unwrap();
    let segment = space.create_segment(None, 38).unwrap().unwrap();

    // Two bytes into the real header reads a foreign space id
    let bogus = SegmentRef::new(segment.page_no, 40);
    assert_corruption(space.n_reserved_pages(bogus));

    let err = space.create_segment(Some(segment.page_no), 4095).unwrap_err();
    assert!(matches!(err, SpaceError::InvalidSegmentHeader { offset: 4095, .. }));
}
