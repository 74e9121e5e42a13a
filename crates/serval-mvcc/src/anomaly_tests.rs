//! Serialization-anomaly and reclamation scenarios exercised end to end
//! through the engine façade: write-write conflicts, anti-dependency back
//! edges under both policies, the old-version read optimization with
//! departed readers, segment rollover, and chain reachability under
//! concurrent reclamation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serval_error::{AbortReason, EngineError};
use serval_region::{GcState, PR_LOCKOUT, PR_MARK, TupleVector};
use serval_types::{BackEdgePolicy, EngineConfig, Lsn, Oid};

use crate::txn::{Engine, Worker};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn engine_with(policy: BackEdgePolicy, old_threshold: u64) -> Arc<Engine> {
    Engine::new(EngineConfig {
        segment_bits: 16,
        num_segments: 4,
        cold_capacity: 1 << 17,
        trim_mark: 1 << 30,
        registry_slots: 64,
        old_version_threshold: old_threshold,
        back_edge_policy: policy,
        numa_nodes: 1,
    })
    .unwrap()
}

fn engine_default() -> Arc<Engine> {
    engine_with(BackEdgePolicy::AllowViaSstampCas, 1 << 40)
}

/// Commit one version of a fresh oid and return it.
fn seed(engine: &Arc<Engine>, w: &mut Worker, table: &Arc<TupleVector>, payload: &[u8]) -> Oid {
    let oid = table.alloc_oid().unwrap();
    let mut t = w.begin().unwrap();
    engine.write(&mut t, table, oid, payload).unwrap();
    engine.precommit(&mut t).unwrap();
    engine.postcommit(t);
    oid
}

fn abort_reason(err: EngineError) -> AbortReason {
    match err {
        EngineError::Abort(a) => a.reason,
        other => panic!("expected a transaction abort, got {other}"),
    }
}

/// Walk a chain head→tail checking committed clsn strictly decreases.
fn assert_chain_monotone(table: &TupleVector, oid: Oid) {
    let mut cur = table.head(oid);
    let mut newer: Option<Lsn> = None;
    while !cur.is_null() {
        let v = unsafe { cur.deref() };
        let w = v.clsn();
        if let Some(bound) = newer {
            assert!(
                w.is_lsn() && w.lsn() < bound,
                "{oid}: chain clsn not strictly decreasing"
            );
        }
        if w.is_lsn() {
            newer = Some(w.lsn());
        }
        cur = v.next();
    }
}

// ---------------------------------------------------------------------------
// Conflict scenarios
// ---------------------------------------------------------------------------

#[test]
fn test_write_write_conflict_second_writer_aborts() {
    let engine = engine_default();
    let mut w0 = engine.attach_worker().unwrap();
    let mut w1 = engine.attach_worker().unwrap();
    let mut w2 = engine.attach_worker().unwrap();
    let table = engine.create_table(16);
    let oid = seed(&engine, &mut w0, &table, b"v0");

    let mut t1 = w1.begin().unwrap();
    let mut t2 = w2.begin().unwrap();
    assert_eq!(engine.read(&mut t1, &table, oid).unwrap(), Some(&b"v0"[..]));
    assert_eq!(engine.read(&mut t2, &table, oid).unwrap(), Some(&b"v0"[..]));

    engine.write(&mut t1, &table, oid, b"v1").unwrap();
    let err = engine.write(&mut t2, &table, oid, b"v1x").unwrap_err();
    assert_eq!(abort_reason(err), AbortReason::WwConflict);

    engine.precommit(&mut t1).unwrap();
    engine.postcommit(t1);
    assert_eq!(engine.metrics.snapshot().aborts_ww, 1);
}

#[test]
fn test_tracked_reader_back_edge_via_sstamp_cas() {
    let engine = engine_default();
    let mut w0 = engine.attach_worker().unwrap();
    let mut w1 = engine.attach_worker().unwrap();
    let mut w2 = engine.attach_worker().unwrap();
    let mut w3 = engine.attach_worker().unwrap();
    let table = engine.create_table(16);
    let x = seed(&engine, &mut w0, &table, b"x0");
    let y = seed(&engine, &mut w0, &table, b"y0");

    // T1 tracks a read of X and stays active
    let mut t1 = w1.begin().unwrap();
    assert!(engine.read(&mut t1, &table, x).unwrap().is_some());

    // T2 overwrites X; T1's reader bit forms a T2→T1 back edge, resolved
    // by pushing T2's successor stamp into T1's slot
    let mut t2 = w2.begin().unwrap();
    engine.write(&mut t2, &table, x, b"x1").unwrap();
    let c2 = engine.precommit(&mut t2).unwrap();
    engine.postcommit(t2);
    assert_eq!(
        engine.registry().slot(t1.registry_slot()).sstamp_raw(),
        c2.raw()
    );

    // T3 raises Y's reader watermark above c2
    let mut t3 = w3.begin().unwrap();
    assert!(engine.read(&mut t3, &table, y).unwrap().is_some());
    let c3 = engine.precommit(&mut t3).unwrap();
    engine.postcommit(t3);
    assert!(c3 > c2);

    // T1 now overwrites Y: pstamp >= c3 > sstamp = c2 closes the window
    engine.write(&mut t1, &table, y, b"y1").unwrap();
    let err = engine.precommit(&mut t1).unwrap_err();
    assert!(matches!(
        abort_reason(err),
        AbortReason::Exclusion { pstamp, sstamp }
            if pstamp >= c3 && sstamp == c2
    ));
}

#[test]
fn test_forbid_policy_requests_reader_abort() {
    let engine = engine_with(BackEdgePolicy::ForbidWithAbort, 1 << 40);
    let mut w0 = engine.attach_worker().unwrap();
    let mut w1 = engine.attach_worker().unwrap();
    let mut w2 = engine.attach_worker().unwrap();
    let table = engine.create_table(16);
    let x = seed(&engine, &mut w0, &table, b"x0");

    let mut t1 = w1.begin().unwrap();
    assert!(engine.read(&mut t1, &table, x).unwrap().is_some());

    let mut t2 = w2.begin().unwrap();
    engine.write(&mut t2, &table, x, b"x1").unwrap();
    engine.precommit(&mut t2).unwrap();
    engine.postcommit(t2);

    // the flagged reader observes the request at its next operation
    let err = engine.read(&mut t1, &table, x).unwrap_err();
    assert_eq!(abort_reason(err), AbortReason::ShouldAbort);
    assert_eq!(engine.metrics.snapshot().aborts_should_abort, 1);
}

#[test]
fn test_write_skew_is_rejected() {
    let engine = engine_default();
    let mut w0 = engine.attach_worker().unwrap();
    let mut w1 = engine.attach_worker().unwrap();
    let mut w2 = engine.attach_worker().unwrap();
    let table = engine.create_table(16);
    let x = seed(&engine, &mut w0, &table, b"x0");
    let y = seed(&engine, &mut w0, &table, b"y0");

    let mut t1 = w1.begin().unwrap();
    let mut t2 = w2.begin().unwrap();
    assert!(engine.read(&mut t1, &table, x).unwrap().is_some());
    assert!(engine.read(&mut t2, &table, y).unwrap().is_some());
    engine.write(&mut t1, &table, y, b"y1").unwrap();
    engine.write(&mut t2, &table, x, b"x1").unwrap();

    engine.precommit(&mut t1).unwrap();
    engine.postcommit(t1);
    let err = engine.precommit(&mut t2).unwrap_err();
    assert!(matches!(abort_reason(err), AbortReason::Exclusion { .. }));
}

#[test]
fn test_snapshot_reads_ignore_later_commits() {
    let engine = engine_default();
    let mut w0 = engine.attach_worker().unwrap();
    let mut w1 = engine.attach_worker().unwrap();
    let mut w2 = engine.attach_worker().unwrap();
    let table = engine.create_table(16);
    let x = seed(&engine, &mut w0, &table, b"x0");

    let mut t1 = w1.begin().unwrap();
    let mut t2 = w2.begin().unwrap();
    engine.write(&mut t2, &table, x, b"x1").unwrap();
    engine.precommit(&mut t2).unwrap();
    engine.postcommit(t2);

    // T1's snapshot predates c2
    assert_eq!(engine.read(&mut t1, &table, x).unwrap(), Some(&b"x0"[..]));
    engine.precommit(&mut t1).unwrap();
    engine.postcommit(t1);
}

// ---------------------------------------------------------------------------
// Old-version read optimization
// ---------------------------------------------------------------------------

#[test]
fn test_old_read_marks_but_does_not_track() {
    let engine = engine_with(BackEdgePolicy::AllowViaSstampCas, 0);
    let mut w0 = engine.attach_worker().unwrap();
    let mut w1 = engine.attach_worker().unwrap();
    let mut w2 = engine.attach_worker().unwrap();
    let table = engine.create_table(16);
    // give W1's slot a last-committed stamp to fold later
    let _warmup = seed(&engine, &mut w1, &table, b"warm");
    let x = seed(&engine, &mut w0, &table, b"x0");

    let mut t1 = w1.begin().unwrap();
    assert!(engine.read(&mut t1, &table, x).unwrap().is_some());
    let head = table.head(x);
    let hv = unsafe { head.deref() };
    assert_eq!(hv.marker() & PR_MARK, PR_MARK);
    assert_eq!(engine.metrics.snapshot().old_reads, 1);

    // the updater locks out new old-readers and resolves the persistent
    // reader through the registry
    let mut t2 = w2.begin().unwrap();
    engine.write(&mut t2, &table, x, b"x1").unwrap();
    let last = engine.registry().get_last_committed(t1.registry_slot());
    assert!(last.is_valid());
    engine.precommit(&mut t2).unwrap();
    assert!(t2.pstamp() >= last);
    engine.postcommit(t2);
    assert_eq!(hv.marker(), PR_MARK | PR_LOCKOUT);

    // the persistent reader commits read-only; its bit stays behind
    engine.precommit(&mut t1).unwrap();
    engine.postcommit(t1);
    assert_ne!(hv.readers(0), 0);
}

#[test]
fn test_departed_old_reader_folds_last_committed() {
    let engine = engine_with(BackEdgePolicy::AllowViaSstampCas, 0);
    let mut w0 = engine.attach_worker().unwrap();
    let mut w1 = engine.attach_worker().unwrap();
    let mut w2 = engine.attach_worker().unwrap();
    let table = engine.create_table(16);
    let y = seed(&engine, &mut w0, &table, b"y0");

    // old read, then commit and deregister: the bit stays, the xid goes
    let mut t1 = w1.begin().unwrap();
    assert!(engine.read(&mut t1, &table, y).unwrap().is_some());
    let slot = t1.registry_slot();
    let c1 = engine.precommit(&mut t1).unwrap();
    engine.postcommit(t1);
    assert_eq!(engine.registry().get_last_committed(slot), c1);

    let mut t2 = w2.begin().unwrap();
    engine.write(&mut t2, &table, y, b"y1").unwrap();
    engine.precommit(&mut t2).unwrap();
    // the vanished reader's worst-case cstamp was folded
    assert!(t2.pstamp() >= c1);
    engine.postcommit(t2);
}

#[test]
fn test_old_read_of_overwritten_version_bounds_successor() {
    let engine = engine_with(BackEdgePolicy::AllowViaSstampCas, 0);
    let mut w0 = engine.attach_worker().unwrap();
    let mut w1 = engine.attach_worker().unwrap();
    let mut w2 = engine.attach_worker().unwrap();
    let mut w3 = engine.attach_worker().unwrap();
    let table = engine.create_table(16);
    let x = seed(&engine, &mut w0, &table, b"x0");
    let z = seed(&engine, &mut w0, &table, b"z0");

    // T1's snapshot predates the overwrite of X
    let mut t1 = w1.begin().unwrap();

    // T2 overwrites X and finalizes X0's successor stamp
    let mut t2 = w2.begin().unwrap();
    engine.write(&mut t2, &table, x, b"x1").unwrap();
    let c2 = engine.precommit(&mut t2).unwrap();
    engine.postcommit(t2);

    // T3 leaves a commit stamp above c2 behind on Z's reader slot
    let mut t3 = w3.begin().unwrap();
    assert!(engine.read(&mut t3, &table, z).unwrap().is_some());
    let c3 = engine.precommit(&mut t3).unwrap();
    engine.postcommit(t3);
    assert!(c3 > c2);

    // T1's old read of X0 is untracked, so pre-commit never revisits it;
    // the fold at read time is the only thing carrying the c2 bound
    assert_eq!(engine.read(&mut t1, &table, x).unwrap(), Some(&b"x0"[..]));
    engine.write(&mut t1, &table, z, b"z1").unwrap();
    let err = engine.precommit(&mut t1).unwrap_err();
    assert!(matches!(
        abort_reason(err),
        AbortReason::Exclusion { pstamp, sstamp }
            if pstamp >= c3 && sstamp == c2
    ));
}

#[test]
fn test_reader_lockout_aborts_old_read() {
    let engine = engine_with(BackEdgePolicy::AllowViaSstampCas, 0);
    let mut w0 = engine.attach_worker().unwrap();
    let mut w1 = engine.attach_worker().unwrap();
    let table = engine.create_table(16);
    let z = seed(&engine, &mut w0, &table, b"z0");

    // a committing writer holds the lockout bit
    let head = table.head(z);
    unsafe { head.deref() }.lockout_persistent_readers();

    let mut t1 = w1.begin().unwrap();
    let err = engine.read(&mut t1, &table, z).unwrap_err();
    assert_eq!(abort_reason(err), AbortReason::ReaderLockout);
    assert_eq!(engine.metrics.snapshot().aborts_lockout, 1);
}

// ---------------------------------------------------------------------------
// Lifecycle edges
// ---------------------------------------------------------------------------

#[test]
fn test_abort_restores_previous_version() {
    let engine = engine_default();
    let mut w0 = engine.attach_worker().unwrap();
    let mut w1 = engine.attach_worker().unwrap();
    let table = engine.create_table(16);
    let x = seed(&engine, &mut w0, &table, b"x0");
    let head_before = table.head(x);

    let mut t1 = w1.begin().unwrap();
    engine.write(&mut t1, &table, x, b"doomed").unwrap();
    assert_ne!(table.head(x), head_before);
    engine.abort(t1);
    assert_eq!(table.head(x), head_before);
    // the overwrite tag was cleared too: a new writer succeeds
    let mut t2 = w1.begin().unwrap();
    engine.write(&mut t2, &table, x, b"x1").unwrap();
    engine.precommit(&mut t2).unwrap();
    engine.postcommit(t2);
}

#[test]
fn test_own_writes_are_visible_and_replaceable() {
    let engine = engine_default();
    let mut w0 = engine.attach_worker().unwrap();
    let table = engine.create_table(16);
    let x = seed(&engine, &mut w0, &table, b"x0");

    let mut t = w0.begin().unwrap();
    engine.write(&mut t, &table, x, b"first").unwrap();
    assert_eq!(engine.read(&mut t, &table, x).unwrap(), Some(&b"first"[..]));
    engine.write(&mut t, &table, x, b"second").unwrap();
    assert_eq!(engine.read(&mut t, &table, x).unwrap(), Some(&b"second"[..]));
    engine.precommit(&mut t).unwrap();
    engine.postcommit(t);

    let mut t = w0.begin().unwrap();
    assert_eq!(engine.read(&mut t, &table, x).unwrap(), Some(&b"second"[..]));
    engine.abort(t);
    assert_chain_monotone(&table, x);
}

#[test]
fn test_slot_exhaustion_surfaces_at_begin() {
    let engine = Engine::new(EngineConfig {
        segment_bits: 16,
        num_segments: 4,
        cold_capacity: 1 << 16,
        trim_mark: 1 << 30,
        registry_slots: 1,
        old_version_threshold: 1 << 40,
        back_edge_policy: BackEdgePolicy::AllowViaSstampCas,
        numa_nodes: 1,
    })
    .unwrap();
    let mut w1 = engine.attach_worker().unwrap();
    let mut w2 = engine.attach_worker().unwrap();

    let t1 = w1.begin().unwrap();
    assert!(matches!(
        w2.begin(),
        Err(EngineError::SlotExhausted { limit: 1 })
    ));
    engine.abort(t1);
    drop(w1); // releases the slot
    let t2 = w2.begin().unwrap();
    engine.abort(t2);
}

#[test]
fn test_serial_updates_keep_chain_monotone() {
    let engine = engine_default();
    let mut w = engine.attach_worker().unwrap();
    let table = engine.create_table(16);
    let x = seed(&engine, &mut w, &table, b"gen-0");

    for gen in 1..20_u32 {
        let mut t = w.begin().unwrap();
        let payload = format!("gen-{gen}");
        engine.write(&mut t, &table, x, payload.as_bytes()).unwrap();
        engine.precommit(&mut t).unwrap();
        engine.postcommit(t);
    }
    let mut t = w.begin().unwrap();
    assert_eq!(engine.read(&mut t, &table, x).unwrap(), Some(&b"gen-19"[..]));
    engine.abort(t);
    assert_chain_monotone(&table, x);
    assert_eq!(engine.metrics.snapshot().commits, 20);
}

// ---------------------------------------------------------------------------
// Segment rollover and reclamation
// ---------------------------------------------------------------------------

#[test]
fn test_segment_rollover_reclaims_and_returns_to_normal() {
    let engine = Engine::new(EngineConfig {
        segment_bits: 10,
        num_segments: 4,
        cold_capacity: 4096,
        trim_mark: 1 << 30,
        registry_slots: 8,
        old_version_threshold: 1 << 40,
        back_edge_policy: BackEdgePolicy::AllowViaSstampCas,
        numa_nodes: 1,
    })
    .unwrap();
    let mut w = engine.attach_worker().unwrap();
    let table = engine.create_table(64);
    // 50-byte payloads do not pack a 1 KiB segment evenly, so a boundary
    // straddle is guaranteed
    let oid = seed(&engine, &mut w, &table, &[1_u8; 50]);

    let region = || engine.regions().region(0);
    while region().state() == GcState::Normal {
        let mut t = w.begin().unwrap();
        engine.write(&mut t, &table, oid, &[2_u8; 50]).unwrap();
        engine.precommit(&mut t).unwrap();
        engine.postcommit(t);
    }
    assert_eq!(region().state(), GcState::Requested);
    let horizon_before = region().reclaimed_offset();

    // drive the epoch machinery until the segment comes back
    let deadline = Instant::now() + Duration::from_secs(5);
    while region().state() != GcState::Normal || region().reclaimed_offset() == horizon_before {
        assert!(Instant::now() < deadline, "segment never reclaimed");
        engine.epochs().new_epoch();
        engine.epochs().tick();
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(
        region().reclaimed_offset(),
        horizon_before + region().segment_size()
    );
    assert!(engine.trim_lsn().is_valid());
    assert_chain_monotone(&table, oid);

    // live data survived compaction
    let mut t = w.begin().unwrap();
    assert_eq!(
        engine.read(&mut t, &table, oid).unwrap(),
        Some(&[2_u8; 50][..])
    );
    engine.abort(t);
}

#[test]
fn test_reclaim_preserves_reachability_under_concurrent_readers() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let engine = Engine::new(EngineConfig {
        segment_bits: 13,
        num_segments: 8,
        cold_capacity: 1 << 15,
        trim_mark: 2048,
        registry_slots: 16,
        old_version_threshold: 1 << 40,
        back_edge_policy: BackEdgePolicy::AllowViaSstampCas,
        numa_nodes: 1,
    })
    .unwrap();
    let table = engine.create_table(64);
    let mut seeder = engine.attach_worker().unwrap();
    const OIDS: u64 = 8;
    let mut oids = Vec::new();
    for i in 0..OIDS {
        let mut payload = [0_u8; 48];
        payload[..8].copy_from_slice(&(i + 1).to_le_bytes());
        oids.push(seed(&engine, &mut seeder, &table, &payload));
    }
    let oids = Arc::new(oids);
    let commits = Arc::new(AtomicU64::new(0));

    let mut handles = Vec::new();
    for writer_id in 0..2_u64 {
        let engine = Arc::clone(&engine);
        let table = Arc::clone(&table);
        let oids = Arc::clone(&oids);
        let commits = Arc::clone(&commits);
        handles.push(thread::spawn(move || {
            let mut w = engine.attach_worker().unwrap();
            for round in 0..400_u64 {
                // give the daemon room while a round is pending
                while engine.regions().region(0).state() != GcState::Normal {
                    engine.epochs().new_epoch();
                    engine.epochs().tick();
                    thread::sleep(Duration::from_micros(200));
                }
                let oid = oids[((writer_id + round) % OIDS) as usize];
                let mut payload = [0_u8; 48];
                payload[..8].copy_from_slice(&oid.raw().to_le_bytes());
                payload[8..16].copy_from_slice(&round.to_le_bytes());

                let mut t = w.begin().unwrap();
                match engine.write(&mut t, &table, oid, &payload) {
                    Ok(()) => {}
                    Err(EngineError::Abort(_)) => continue,
                    Err(e) => panic!("writer hit fatal error: {e}"),
                }
                match engine.precommit(&mut t) {
                    Ok(_) => {
                        engine.postcommit(t);
                        commits.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(EngineError::Abort(_)) => {}
                    Err(e) => panic!("writer hit fatal error: {e}"),
                }
            }
        }));
    }
    for _ in 0..2 {
        let engine = Arc::clone(&engine);
        let table = Arc::clone(&table);
        let oids = Arc::clone(&oids);
        handles.push(thread::spawn(move || {
            let mut w = engine.attach_worker().unwrap();
            for round in 0..600_u64 {
                let mut t = w.begin().unwrap();
                let oid = oids[(round % OIDS) as usize];
                match engine.read(&mut t, &table, oid) {
                    Ok(Some(payload)) => {
                        assert_eq!(payload.len(), 48);
                        assert_eq!(&payload[..8], &oid.raw().to_le_bytes());
                        engine.abort(t);
                    }
                    // a snapshot older than the newest version may find its
                    // visible version already below the trim horizon
                    Ok(None) => engine.abort(t),
                    Err(EngineError::Abort(_)) => {}
                    Err(e) => panic!("reader hit fatal error: {e}"),
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert!(commits.load(Ordering::Relaxed) > 100);
    // every chain still resolves to its live payload, newest first
    let mut w = engine.attach_worker().unwrap();
    let mut t = w.begin().unwrap();
    for &oid in oids.iter() {
        let payload = engine.read(&mut t, &table, oid).unwrap().unwrap();
        assert_eq!(&payload[..8], &oid.raw().to_le_bytes());
        assert_chain_monotone(&table, oid);
    }
    engine.abort(t);
}
