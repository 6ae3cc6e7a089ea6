//! Guest export/import round trips and seek table checks.

use std::fs;

use proptest::prelude::*;
use vmdisk::archive::SeekTable;
use vmdisk::{DiskImageStatus, DiskOpsOptions, TerminaVmExportOperation, TerminaVmImportOperation};
use vmdisk_shared::constants::seekable::{MAX_FRAME_INPUT, SKIPPABLE_MAGIC};
use vmdisk_test_utils::{TestContext, drive_to_completion, image_bytes, sha256_hex, vm};

// ============================================================================
// HELPERS
// ============================================================================

/// Export `data` and return the container bytes plus the digest file text.
fn export(ctx: &TestContext, data: &[u8], io_limit: u64) -> (Vec<u8>, String) {
    let source = ctx.write_file("termina.img", data);
    let mut op = TerminaVmExportOperation::create(
        vm(),
        source,
        ctx.output("termina.zst"),
        Some(ctx.output("termina.sha256")),
        &DiskOpsOptions::default(),
    );
    assert_eq!(op.status(), DiskImageStatus::InProgress);
    assert_eq!(
        drive_to_completion(&mut op, io_limit),
        DiskImageStatus::Created
    );
    assert_eq!(op.progress(), 100);

    (
        fs::read(ctx.path("termina.zst")).unwrap(),
        fs::read_to_string(ctx.path("termina.sha256")).unwrap(),
    )
}

// ============================================================================
// ROUND TRIP
// ============================================================================

#[test]
fn export_then_import_reproduces_image() {
    let ctx = TestContext::new();
    let data = image_bytes(5 * MAX_FRAME_INPUT / 2);
    let (container, digest) = export(&ctx, &data, 64 * 1024);

    assert_eq!(digest, format!("{}\n", sha256_hex(&container)));

    let dest = ctx.path("restored/termina.img");
    fs::create_dir(ctx.path("restored")).unwrap();
    let mut op = TerminaVmImportOperation::create(
        vm(),
        ctx.open("termina.zst"),
        dest.clone(),
        &DiskOpsOptions::default(),
    );
    assert_eq!(
        drive_to_completion(&mut op, 64 * 1024),
        DiskImageStatus::Created
    );

    assert_eq!(fs::read(&dest).unwrap(), data);
    assert!(!ctx.path("restored/termina.img.import").exists());
}

#[test]
fn empty_image_round_trip() {
    let ctx = TestContext::new();
    let (container, _) = export(&ctx, b"", 1);

    // One empty frame keeps the container recognisable as zstd
    assert_eq!(&container[..4], &[0x28, 0xB5, 0x2F, 0xFD]);
    let table = SeekTable::read_from(&ctx.open("termina.zst")).unwrap();
    assert_eq!(table.len(), 1);
    assert_eq!(
        table.payload_size() as usize + table.encoded_len(),
        container.len()
    );

    let dest = ctx.path("restored/termina.img");
    fs::create_dir(ctx.path("restored")).unwrap();
    let mut op = TerminaVmImportOperation::create(
        vm(),
        ctx.open("termina.zst"),
        dest.clone(),
        &DiskOpsOptions::default(),
    );
    assert_eq!(op.status(), DiskImageStatus::InProgress);
    assert_eq!(drive_to_completion(&mut op, 1), DiskImageStatus::Created);

    assert_eq!(fs::metadata(&dest).unwrap().len(), 0);
    assert!(!ctx.path("restored/termina.img.import").exists());
}

#[test]
fn sparse_image_round_trip_keeps_size() {
    let ctx = TestContext::new();
    let len = 8 * 1024 * 1024;
    let source = ctx.sparse_file(
        "termina.img",
        len,
        &[
            (0, &b"bootsector"[..]),
            (3 * 1024 * 1024, &b"middle"[..]),
            (len - 4, &b"tail"[..]),
        ],
    );
    let original = fs::read(&source).unwrap();

    let mut export = TerminaVmExportOperation::create(
        vm(),
        source,
        ctx.output("termina.zst"),
        None,
        &DiskOpsOptions::default(),
    );
    assert_eq!(
        drive_to_completion(&mut export, 1 << 20),
        DiskImageStatus::Created
    );

    let dest = ctx.path("imported.img");
    let mut import = TerminaVmImportOperation::create(
        vm(),
        ctx.open("termina.zst"),
        dest.clone(),
        &DiskOpsOptions::default(),
    );
    assert_eq!(
        drive_to_completion(&mut import, 1 << 20),
        DiskImageStatus::Created
    );

    assert_eq!(fs::metadata(&dest).unwrap().len(), len);
    assert_eq!(fs::read(&dest).unwrap(), original);
}

// ============================================================================
// SEEK TABLE
// ============================================================================

#[test]
fn seek_table_covers_payload_exactly() {
    let ctx = TestContext::new();
    let data = image_bytes(3 * MAX_FRAME_INPUT + 77);
    let (container, _) = export(&ctx, &data, 1 << 20);

    let table = SeekTable::read_from(&ctx.open("termina.zst")).unwrap();
    assert_eq!(table.decompressed_size(), data.len() as u64);

    let trailer_start = table.payload_size() as usize;
    assert_eq!(
        &container[trailer_start..trailer_start + 4],
        &SKIPPABLE_MAGIC.to_le_bytes()
    );
    assert_eq!(container.len() - trailer_start, table.encoded_len());
}

#[test]
fn seek_table_allows_random_access() {
    let ctx = TestContext::new();
    let data = image_bytes(4 * MAX_FRAME_INPUT);
    export(&ctx, &data, 1 << 20);

    let file = ctx.open("termina.zst");
    let table = SeekTable::read_from(&file).unwrap();

    let offset = 2 * MAX_FRAME_INPUT as u64 + 100;
    let location = table.frame_for_offset(offset).unwrap();
    assert_eq!(location.index, 2);
    assert_eq!(location.decompressed_offset, 2 * MAX_FRAME_INPUT as u64);

    let frame = table.read_frame(&file, location.index).unwrap();
    let start = location.decompressed_offset as usize;
    assert_eq!(frame, &data[start..start + frame.len()]);
    assert!(table.frame_for_offset(data.len() as u64).is_none());
}

// ============================================================================
// PROGRESS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn export_progress_is_monotonic(
        len in 0usize..(3 * MAX_FRAME_INPUT),
        limits in prop::collection::vec(1u64..200_000, 1..8),
    ) {
        let ctx = TestContext::new();
        let source = ctx.write_file("termina.img", &image_bytes(len));
        let mut op = TerminaVmExportOperation::create(
            vm(),
            source,
            ctx.output("termina.zst"),
            None,
            &DiskOpsOptions::default(),
        );

        let mut last_processed = 0;
        let mut last_progress = 0;
        let mut step = 0;
        while op.status() == DiskImageStatus::InProgress {
            op.run(limits[step % limits.len()]).unwrap();
            step += 1;
            prop_assert!(op.processed_size() >= last_processed);
            prop_assert!(op.progress() >= last_progress);
            last_processed = op.processed_size();
            last_progress = op.progress();
        }

        prop_assert_eq!(op.status(), DiskImageStatus::Created);
        prop_assert_eq!(op.progress(), 100);
        prop_assert_eq!(op.processed_size(), 2 * len as u64);
    }
}
