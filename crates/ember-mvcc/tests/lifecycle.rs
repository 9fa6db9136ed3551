//! Transaction lifecycle behavior over the public engine surface.

use ember_mvcc::{CommitProtocol, Engine, EngineConfig};
use ember_error::EmberError;
use ember_types::{AbortReason, TxnFlags, TxnState};

fn engine() -> Engine {
    Engine::new(EngineConfig::default())
}

#[test]
fn committed_insert_is_visible_to_later_snapshots() {
    let engine = engine();
    let table = engine.create_table("kv");

    let mut t1 = engine.begin(TxnFlags::NONE).unwrap();
    assert!(engine.insert(&mut t1, &table, b"k1", b"A").unwrap());
    let commit_lsn = engine.commit(t1).unwrap();

    let mut t2 = engine.begin(TxnFlags::NONE).unwrap();
    assert!(t2.begin() >= commit_lsn);
    assert_eq!(
        engine.read(&mut t2, &table, b"k1").unwrap(),
        Some(b"A".to_vec())
    );

    // The creator of the version we read is our predecessor.
    let (pstamp, sstamp) = engine.ssn_stamps(&t2);
    assert_eq!(pstamp, commit_lsn.offset());
    assert_eq!(sstamp, u64::MAX, "no overwriter evidence yet");
    engine.commit(t2).unwrap();
}

#[test]
fn uncommitted_writes_stay_invisible() {
    let engine = engine();
    let table = engine.create_table("kv");

    let mut writer = engine.begin(TxnFlags::NONE).unwrap();
    assert!(engine.insert(&mut writer, &table, b"k", b"draft").unwrap());

    let mut reader = engine.begin(TxnFlags::NONE).unwrap();
    assert_eq!(engine.read(&mut reader, &table, b"k").unwrap(), None);

    engine.commit(writer).unwrap();
    // The reader's snapshot predates the commit.
    assert_eq!(engine.read(&mut reader, &table, b"k").unwrap(), None);
    engine.commit(reader).unwrap();

    let mut late = engine.begin(TxnFlags::NONE).unwrap();
    assert_eq!(
        engine.read(&mut late, &table, b"k").unwrap(),
        Some(b"draft".to_vec())
    );
    engine.commit(late).unwrap();
}

#[test]
fn concurrent_update_of_one_key_is_a_write_write_conflict() {
    let engine = engine();
    let table = engine.create_table("kv");

    let mut setup = engine.begin(TxnFlags::NONE).unwrap();
    assert!(engine.insert(&mut setup, &table, b"k1", b"v0").unwrap());
    engine.commit(setup).unwrap();

    let mut t1 = engine.begin(TxnFlags::NONE).unwrap();
    let mut t2 = engine.begin(TxnFlags::NONE).unwrap();
    assert!(engine.update(&mut t1, &table, b"k1", b"t1").unwrap());

    // T1's write is still in flight: first writer wins.
    assert!(!engine.update(&mut t2, &table, b"k1", b"t2").unwrap());
    assert!(t2.is_resolved(), "conflict aborts the loser");
    assert!(matches!(
        engine.commit(t2),
        Err(EmberError::InvalidTxnState {
            actual: TxnState::Aborted,
            ..
        })
    ));

    engine.commit(t1).unwrap();
    let mut check = engine.begin(TxnFlags::NONE).unwrap();
    assert_eq!(
        engine.read(&mut check, &table, b"k1").unwrap(),
        Some(b"t1".to_vec())
    );
    engine.commit(check).unwrap();
}

#[test]
fn update_against_a_newer_committed_version_conflicts() {
    let engine = engine();
    let table = engine.create_table("kv");

    let mut setup = engine.begin(TxnFlags::NONE).unwrap();
    assert!(engine.insert(&mut setup, &table, b"k1", b"v0").unwrap());
    engine.commit(setup).unwrap();

    // Snapshot taken before the second committer.
    let mut stale = engine.begin(TxnFlags::NONE).unwrap();
    assert_eq!(
        engine.read(&mut stale, &table, b"k1").unwrap(),
        Some(b"v0".to_vec())
    );

    let mut winner = engine.begin(TxnFlags::NONE).unwrap();
    assert!(engine.update(&mut winner, &table, b"k1", b"v1").unwrap());
    engine.commit(winner).unwrap();

    assert!(!engine.update(&mut stale, &table, b"k1", b"late").unwrap());
    assert!(stale.is_resolved());
}

#[test]
fn read_own_writes_and_self_update_collapse() {
    let engine = engine();
    let table = engine.create_table("kv");

    let mut t1 = engine.begin(TxnFlags::NONE).unwrap();
    assert!(engine.insert(&mut t1, &table, b"k2", b"X").unwrap());
    assert_eq!(
        engine.read(&mut t1, &table, b"k2").unwrap(),
        Some(b"X".to_vec())
    );

    assert!(engine.update(&mut t1, &table, b"k2", b"Y").unwrap());
    assert_eq!(
        engine.read(&mut t1, &table, b"k2").unwrap(),
        Some(b"Y".to_vec()),
        "read after write returns the written value"
    );
    assert_eq!(t1.write_set_len(), 1, "self-updates collapse to one entry");
    engine.commit(t1).unwrap();

    // Exactly one version survives for the key.
    engine.reclaim();
    assert_eq!(engine.live_version_count(), 1);

    let mut check = engine.begin(TxnFlags::NONE).unwrap();
    assert_eq!(
        engine.read(&mut check, &table, b"k2").unwrap(),
        Some(b"Y".to_vec())
    );
    engine.commit(check).unwrap();
}

#[test]
fn abort_is_externally_a_no_op() {
    let engine = engine();
    let table = engine.create_table("kv");

    let mut t1 = engine.begin(TxnFlags::NONE).unwrap();
    assert!(engine.insert(&mut t1, &table, b"gone", b"draft").unwrap());
    engine.abort(t1, AbortReason::User);

    let mut t2 = engine.begin(TxnFlags::NONE).unwrap();
    assert_eq!(engine.read(&mut t2, &table, b"gone").unwrap(), None);

    // The key binding survived with an empty chain; a later insert
    // revives the OID.
    assert!(engine.insert(&mut t2, &table, b"gone", b"real").unwrap());
    engine.commit(t2).unwrap();

    let mut t3 = engine.begin(TxnFlags::NONE).unwrap();
    assert_eq!(
        engine.read(&mut t3, &table, b"gone").unwrap(),
        Some(b"real".to_vec())
    );
    engine.commit(t3).unwrap();
}

#[test]
fn duplicate_insert_reports_false_without_aborting() {
    let engine = engine();
    let table = engine.create_table("kv");

    let mut setup = engine.begin(TxnFlags::NONE).unwrap();
    assert!(engine.insert(&mut setup, &table, b"k", b"v").unwrap());
    engine.commit(setup).unwrap();

    let mut t = engine.begin(TxnFlags::NONE).unwrap();
    assert!(!engine.insert(&mut t, &table, b"k", b"other").unwrap());
    assert!(!t.is_resolved(), "duplicate insert is non-fatal");
    assert_eq!(
        engine.read(&mut t, &table, b"k").unwrap(),
        Some(b"v".to_vec())
    );
    engine.commit(t).unwrap();
}

#[test]
fn remove_installs_a_tombstone_and_reinsert_works() {
    let engine = engine();
    let table = engine.create_table("kv");

    let mut t1 = engine.begin(TxnFlags::NONE).unwrap();
    assert!(engine.insert(&mut t1, &table, b"k", b"v1").unwrap());
    engine.commit(t1).unwrap();

    let mut t2 = engine.begin(TxnFlags::NONE).unwrap();
    assert!(engine.remove(&mut t2, &table, b"k").unwrap());
    assert_eq!(engine.read(&mut t2, &table, b"k").unwrap(), None);
    engine.commit(t2).unwrap();

    let mut t3 = engine.begin(TxnFlags::NONE).unwrap();
    assert_eq!(engine.read(&mut t3, &table, b"k").unwrap(), None);
    assert!(engine.insert(&mut t3, &table, b"k", b"v2").unwrap());
    engine.commit(t3).unwrap();

    let mut t4 = engine.begin(TxnFlags::NONE).unwrap();
    assert_eq!(
        engine.read(&mut t4, &table, b"k").unwrap(),
        Some(b"v2".to_vec())
    );
    engine.commit(t4).unwrap();
}

#[test]
fn update_and_remove_of_absent_keys_report_not_found() {
    let engine = engine();
    let table = engine.create_table("kv");

    let mut t = engine.begin(TxnFlags::NONE).unwrap();
    assert_eq!(
        engine.update(&mut t, &table, b"missing", b"v"),
        Err(EmberError::KeyNotFound)
    );
    assert_eq!(
        engine.remove(&mut t, &table, b"missing"),
        Err(EmberError::KeyNotFound)
    );
    assert!(!t.is_resolved());
    engine.commit(t).unwrap();
}

#[test]
fn read_only_transactions_reject_writes() {
    let engine = engine();
    let table = engine.create_table("kv");

    let mut ro = engine.begin(TxnFlags::READ_ONLY).unwrap();
    assert_eq!(
        engine.insert(&mut ro, &table, b"k", b"v"),
        Err(EmberError::ReadOnlyTransaction)
    );
    assert_eq!(engine.read(&mut ro, &table, b"k").unwrap(), None);
    engine.commit(ro).unwrap();
}

#[test]
fn old_versions_are_read_without_tracking() {
    let engine = Engine::new(EngineConfig {
        old_version_threshold: 100,
        ..EngineConfig::default()
    });
    let table = engine.create_table("kv");

    let mut setup = engine.begin(TxnFlags::NONE).unwrap();
    assert!(engine.insert(&mut setup, &table, b"relic", b"v").unwrap());
    engine.commit(setup).unwrap();

    // Push the log tail well past the version's stamp.
    let filler = engine.create_table("filler");
    for i in 0..32_u32 {
        let mut t = engine.begin(TxnFlags::NONE).unwrap();
        assert!(engine
            .insert(&mut t, &filler, &i.to_be_bytes(), &[0_u8; 16])
            .unwrap());
        engine.commit(t).unwrap();
    }

    let mut reader = engine.begin(TxnFlags::NONE).unwrap();
    assert_eq!(
        engine.read(&mut reader, &table, b"relic").unwrap(),
        Some(b"v".to_vec())
    );
    assert_eq!(
        reader.read_set_len(),
        0,
        "old-version reads skip registration and the read set"
    );
    let (pstamp, _) = engine.ssn_stamps(&reader);
    assert_eq!(pstamp, 0, "old-version reads skip stamping");
    engine.commit(reader).unwrap();
}

#[test]
fn low_level_scans_bypass_read_tracking() {
    let engine = engine();
    let table = engine.create_table("kv");

    let mut setup = engine.begin(TxnFlags::NONE).unwrap();
    for (k, v) in [(b"a", b"1"), (b"b", b"2"), (b"c", b"3")] {
        assert!(engine.insert(&mut setup, &table, k, v).unwrap());
    }
    engine.commit(setup).unwrap();

    let mut scanner = engine.begin(TxnFlags::LOW_LEVEL_SCAN).unwrap();
    let mut rows = Vec::new();
    engine
        .scan(&mut scanner, &table, b"a", None, &mut |key, value| {
            rows.push((key.to_vec(), value.to_vec()));
            true
        })
        .unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(scanner.read_set_len(), 0);
    engine.commit(scanner).unwrap();
}

#[test]
fn scan_honors_bounds_and_visitor_stop() {
    let engine = engine();
    let table = engine.create_table("kv");

    let mut setup = engine.begin(TxnFlags::NONE).unwrap();
    for key in [b"a", b"b", b"c", b"d"] {
        assert!(engine.insert(&mut setup, &table, key, b"v").unwrap());
    }
    engine.commit(setup).unwrap();

    let mut t = engine.begin(TxnFlags::NONE).unwrap();

    let mut keys = Vec::new();
    engine
        .scan(&mut t, &table, b"b", Some(b"d"), &mut |key, _| {
            keys.push(key.to_vec());
            true
        })
        .unwrap();
    assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);

    let mut first_only = Vec::new();
    engine
        .scan(&mut t, &table, b"a", None, &mut |key, _| {
            first_only.push(key.to_vec());
            false
        })
        .unwrap();
    assert_eq!(first_only, vec![b"a".to_vec()]);
    engine.commit(t).unwrap();
}

#[test]
fn si_commit_skips_validation_entirely() {
    let engine = Engine::new(EngineConfig {
        commit_protocol: CommitProtocol::SnapshotIsolation,
        ..EngineConfig::default()
    });
    let table = engine.create_table("kv");

    let mut t1 = engine.begin(TxnFlags::NONE).unwrap();
    assert!(engine.insert(&mut t1, &table, b"k", b"v").unwrap());
    engine.commit(t1).unwrap();

    let mut t2 = engine.begin(TxnFlags::NONE).unwrap();
    assert_eq!(
        engine.read(&mut t2, &table, b"k").unwrap(),
        Some(b"v".to_vec())
    );
    assert_eq!(t2.read_set_len(), 0, "SI tracks no reads");
    engine.commit(t2).unwrap();
}

#[test]
fn context_slots_recycle_across_many_transactions() {
    let engine = Engine::new(EngineConfig {
        context_slots: 2,
        ..EngineConfig::default()
    });
    let table = engine.create_table("kv");

    for i in 0..64_u32 {
        let key = i.to_be_bytes();
        let mut t = engine.begin(TxnFlags::NONE).unwrap();
        assert!(engine.insert(&mut t, &table, &key, &key).unwrap());
        engine.commit(t).unwrap();
    }

    let mut check = engine.begin(TxnFlags::NONE).unwrap();
    for i in 0..64_u32 {
        let key = i.to_be_bytes();
        assert_eq!(
            engine.read(&mut check, &table, &key).unwrap(),
            Some(key.to_vec())
        );
    }
    engine.commit(check).unwrap();
}

#[test]
fn sealed_log_turns_commit_into_internal_abort() {
    let engine = engine();
    let table = engine.create_table("kv");

    let mut t = engine.begin(TxnFlags::NONE).unwrap();
    assert!(engine.insert(&mut t, &table, b"k", b"v").unwrap());
    engine.log().seal();
    assert_eq!(
        engine.commit(t),
        Err(EmberError::TransactionAborted {
            reason: AbortReason::Internal
        })
    );

    // The aborted write never became visible.
    let mut check = engine.begin(TxnFlags::NONE).unwrap();
    assert_eq!(engine.read(&mut check, &table, b"k").unwrap(), None);
    engine.abort(check, AbortReason::User);
}
