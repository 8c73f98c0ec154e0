//! End-to-end log lifecycles across restarts.

use pmobj_core::ulog::data_offset;
use pmobj_core::{
    CoreError, LogConfig, LogKind, LogState, OffsetValidator, Operation, ReclaimFlags, UnifiedLog,
};
use pmobj_storage::{FilePool, InMemoryPool, MemFlags, PersistentMemory};
use pmobj_testkit::{init_test_logging, scenarios, TestPool};
use tempfile::TempDir;

#[test]
fn stored_redo_is_replayed_after_restart() {
    init_test_logging();
    let mut t = TestPool::new();
    let mut redo = t.log.transient(&t.pool).unwrap();
    redo.append_value(t.layout.data_word(0), 0xC0FFEE, Operation::Set)
        .unwrap();
    t.log.store(&mut t.pool, &redo).unwrap();
    assert_eq!(t.data_word(0), 0);

    let mut restarted = t.restart();
    assert!(restarted.log.recovery_needed(&restarted.pool).unwrap());
    let report = restarted.recover().unwrap();
    assert_eq!(report.state, LogState::Pending);
    assert_eq!(report.applied, 1);
    assert_eq!(restarted.data_word(0), 0xC0FFEE);
    assert!(!restarted.log.recovery_needed(&restarted.pool).unwrap());
}

#[test]
fn chain_grows_and_entries_straddle_segments() {
    let mut t = TestPool::new();
    let capacity = t.log.reserve(&mut t.pool, 3000, &mut t.alloc).unwrap();
    assert_eq!(capacity, 640 + 10 * 256);
    assert_eq!(t.log.chain().continuations().len(), 10);

    // Reserving what is already there allocates nothing.
    assert_eq!(t.log.reserve(&mut t.pool, 1000, &mut t.alloc).unwrap(), capacity);
    assert_eq!(t.alloc.extended, 10);

    let payload: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
    let mut redo = t.log.transient(&t.pool).unwrap();
    redo.append_buffer(t.layout.data_word(8), &payload, Operation::BufCpy)
        .unwrap();
    redo.append_buffer(t.layout.data_word(200), &[0xAA; 300], Operation::BufSet)
        .unwrap();
    redo.append_value(t.layout.data_word(0), 7, Operation::Set).unwrap();
    assert!(redo.len() > 640);

    t.log.store(&mut t.pool, &redo).unwrap();
    let mut restarted = t.restart();
    assert_eq!(restarted.log.entries(&restarted.pool).unwrap().len(), 3);
    assert_eq!(restarted.recover().unwrap().applied, 3);

    let mut copied = vec![0u8; payload.len()];
    restarted
        .pool
        .read(restarted.layout.data_word(8), &mut copied)
        .unwrap();
    assert_eq!(copied, payload);
    let mut filled = vec![0u8; 300];
    restarted
        .pool
        .read(restarted.layout.data_word(200), &mut filled)
        .unwrap();
    assert!(filled.iter().all(|&b| b == 0xAA));
    assert_eq!(restarted.data_word(0), 7);
}

#[test]
fn stale_continuation_entries_are_not_replayed() {
    let mut t = TestPool::new();
    t.log.reserve(&mut t.pool, 1024, &mut t.alloc).unwrap();
    let first: Vec<u64> = (1..=60).collect();
    let redo = scenarios::redo_setting_words(&t, &first);
    let validator = t.validator;
    let validator: &dyn OffsetValidator<InMemoryPool> = &validator;
    t.log
        .commit(&mut t.pool, &redo, Some(validator), &mut t.alloc)
        .unwrap();
    assert_eq!(t.data_word(59), 60);
    // The warm continuation still holds the first transaction's tail.
    assert_eq!(t.log.chain().continuations().len(), 1);

    t.pool
        .fill(t.layout.data_start, 0, 60 * 8, MemFlags::NONE)
        .unwrap();
    let redo = scenarios::redo_setting_words(&t, &[100, 200]);
    t.log.store(&mut t.pool, &redo).unwrap();

    let mut restarted = t.restart();
    assert_eq!(restarted.recover().unwrap().applied, 2);
    assert_eq!(restarted.data_word(0), 100);
    assert_eq!(restarted.data_word(1), 200);
    for word in 2..60 {
        assert_eq!(restarted.data_word(word), 0, "word {word} replayed");
    }
}

#[test]
fn store_rejects_log_built_for_previous_generation() {
    let mut t = TestPool::new();
    let stale = scenarios::redo_setting_words(&t, &[1]);
    t.log.clobber(&mut t.pool).unwrap();

    let err = t.log.store(&mut t.pool, &stale).unwrap_err();
    assert!(matches!(err, CoreError::InvalidArgument { .. }));
}

#[test]
fn commit_rejects_invalid_destination_before_applying() {
    let mut t = TestPool::with_config(LogConfig::new().consistency_check(true));
    let mut redo = t.log.transient(&t.pool).unwrap();
    redo.append_value(t.layout.data_word(0), 1, Operation::Set).unwrap();
    // Inside the segment arena, outside the data area.
    redo.append_value(t.layout.arena_start, 2, Operation::Set).unwrap();

    let validator = t.validator;
    let validator: &dyn OffsetValidator<InMemoryPool> = &validator;
    let err = t
        .log
        .commit(&mut t.pool, &redo, Some(validator), &mut t.alloc)
        .unwrap_err();
    assert!(matches!(err, CoreError::Corruption { .. }));
    assert!(err.is_fatal());
    assert_eq!(t.data_word(0), 0);
}

#[test]
fn unknown_tag_is_fatal_corruption() {
    let mut t = TestPool::new();
    let word = (0b011u64 << 61) | t.layout.data_start;
    t.pool
        .write_u64(data_offset(t.layout.log_head), word, MemFlags::NONE)
        .unwrap();

    let mut restarted = t.restart();
    let err = restarted.recover().unwrap_err();
    assert!(matches!(err, CoreError::Corruption { .. }));
}

#[test]
fn undo_abort_restores_snapshot() {
    init_test_logging();
    let mut t = TestPool::with_config(LogConfig::new().kind(LogKind::Undo));
    t.pool
        .write_u64(t.layout.data_word(0), 41, MemFlags::NONE)
        .unwrap();
    scenarios::undo_snapshot_then_overwrite(&mut t, 64, 0xEE);
    assert_eq!(t.log.tail(), 128);

    let validator = t.validator;
    let validator: &dyn OffsetValidator<InMemoryPool> = &validator;
    let applied = t.log.abort(&mut t.pool, Some(validator), &mut t.alloc).unwrap();
    assert_eq!(applied, 1);
    assert_eq!(t.data_word(0), 41);
    assert_eq!(t.log.tail(), 0);

    // The retired snapshot is not applied again.
    let mut restarted = t.restart();
    assert_eq!(restarted.log.state(&restarted.pool).unwrap(), LogState::Clean);
    restarted
        .pool
        .write_u64(restarted.layout.data_word(0), 99, MemFlags::NONE)
        .unwrap();
    assert_eq!(restarted.recover().unwrap().applied, 0);
    assert_eq!(restarted.data_word(0), 99);
}

#[test]
fn undo_commit_retires_snapshots() {
    let mut t = TestPool::with_config(LogConfig::new().kind(LogKind::Undo));
    scenarios::undo_snapshot_then_overwrite(&mut t, 128, 0x11);
    let report = t
        .log
        .clobber_data(&mut t.pool, &mut t.alloc, ReclaimFlags::INC_FIRST_GEN)
        .unwrap();
    assert_eq!(report.generation.as_u64(), 1);

    let mut restarted = t.restart();
    assert_eq!(restarted.recover().unwrap().state, LogState::Clean);
    assert_eq!(restarted.data_word(0), 0x1111_1111_1111_1111);
}

#[test]
fn undo_log_reopens_at_tail() {
    let mut t = TestPool::with_config(LogConfig::new().kind(LogKind::Undo));
    scenarios::undo_snapshot_then_overwrite(&mut t, 64, 1);
    scenarios::undo_snapshot_then_overwrite(&mut t, 100, 2);
    let tail = t.log.tail();

    let restarted = t.restart();
    assert_eq!(restarted.log.tail(), tail);
    assert_eq!(restarted.log.entries(&restarted.pool).unwrap().len(), 2);
}

#[test]
fn normalize_on_clean_frees_continuations() {
    let config = LogConfig::new().normalize_on_clean(true);
    let mut t = TestPool::with_config(config);
    t.log.reserve(&mut t.pool, 1500, &mut t.alloc).unwrap();
    assert_eq!(t.log.chain().continuations().len(), 4);

    let mut restarted = t.restart();
    let report = restarted.recover().unwrap();
    assert_eq!(report.state, LogState::Clean);
    assert!(restarted.log.chain().continuations().is_empty());
    assert_eq!(restarted.alloc.freed, 4);
}

#[test]
fn file_pool_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("pool.pmobj");

    {
        let mut pool = FilePool::create(&path, 64 * 1024).unwrap();
        let log = UnifiedLog::construct(&mut pool, 64, LogConfig::default()).unwrap();
        let mut redo = log.transient(&pool).unwrap();
        redo.append_value(32 * 1024, 0xC0FFEE, Operation::Set).unwrap();
        log.store(&mut pool, &redo).unwrap();
    }

    let mut pool = FilePool::open(&path).unwrap();
    let mut log = UnifiedLog::open(&pool, 64, LogConfig::default()).unwrap();
    assert!(log.recovery_needed(&pool).unwrap());
    let report = log.recover(&mut pool, None, None).unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(pool.read_u64(32 * 1024).unwrap(), 0xC0FFEE);
}
