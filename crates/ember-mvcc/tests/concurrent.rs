//! Multi-threaded workloads over the public engine surface.

use std::sync::Arc;
use std::thread;

use ember_mvcc::{Engine, EngineConfig};
use ember_types::TxnFlags;
use rand::{Rng, SeedableRng};

const ACCOUNTS: u64 = 8;
const INITIAL_BALANCE: u64 = 1_000;

fn balance_key(account: u64) -> [u8; 8] {
    account.to_be_bytes()
}

fn decode(value: &[u8]) -> u64 {
    u64::from_be_bytes(value.try_into().expect("balances are 8 bytes"))
}

/// Random transfers between accounts; every admitted history must conserve
/// the total balance.
#[test]
fn concurrent_transfers_conserve_total_balance() {
    let engine = Arc::new(Engine::new(EngineConfig::default()));
    let table = engine.create_table("accounts");

    let mut setup = engine.begin(TxnFlags::NONE).unwrap();
    for account in 0..ACCOUNTS {
        assert!(engine
            .insert(
                &mut setup,
                &table,
                &balance_key(account),
                &INITIAL_BALANCE.to_be_bytes(),
            )
            .unwrap());
    }
    engine.commit(setup).unwrap();

    let mut workers = Vec::new();
    for worker_id in 0..4_u64 {
        let engine = Arc::clone(&engine);
        let table = Arc::clone(&table);
        workers.push(thread::spawn(move || {
            let mut rng = rand::rngs::StdRng::seed_from_u64(0xE3B0 + worker_id);
            let mut commits = 0_u64;
            for _ in 0..300 {
                let from = rng.gen_range(0..ACCOUNTS);
                let mut to = rng.gen_range(0..ACCOUNTS);
                if to == from {
                    to = (to + 1) % ACCOUNTS;
                }
                let amount = rng.gen_range(1..10_u64);

                let Ok(mut txn) = engine.begin(TxnFlags::NONE) else {
                    continue;
                };
                let from_balance = match engine.read(&mut txn, &table, &balance_key(from)) {
                    Ok(Some(value)) => decode(&value),
                    _ => {
                        if !txn.is_resolved() {
                            engine.abort(txn, ember_types::AbortReason::User);
                        }
                        continue;
                    }
                };
                let to_balance = match engine.read(&mut txn, &table, &balance_key(to)) {
                    Ok(Some(value)) => decode(&value),
                    _ => {
                        if !txn.is_resolved() {
                            engine.abort(txn, ember_types::AbortReason::User);
                        }
                        continue;
                    }
                };
                if from_balance < amount {
                    engine.abort(txn, ember_types::AbortReason::User);
                    continue;
                }

                let debit = engine.update(
                    &mut txn,
                    &table,
                    &balance_key(from),
                    &(from_balance - amount).to_be_bytes(),
                );
                if !matches!(debit, Ok(true)) {
                    if !txn.is_resolved() {
                        engine.abort(txn, ember_types::AbortReason::User);
                    }
                    continue;
                }
                let credit = engine.update(
                    &mut txn,
                    &table,
                    &balance_key(to),
                    &(to_balance + amount).to_be_bytes(),
                );
                if !matches!(credit, Ok(true)) {
                    if !txn.is_resolved() {
                        engine.abort(txn, ember_types::AbortReason::User);
                    }
                    continue;
                }

                if engine.commit(txn).is_ok() {
                    commits += 1;
                }
            }
            commits
        }));
    }

    let total_commits: u64 = workers.into_iter().map(|w| w.join().unwrap()).sum();
    assert!(total_commits > 0, "some transfers must get through");

    let mut audit = engine.begin(TxnFlags::NONE).unwrap();
    let mut total = 0_u64;
    for account in 0..ACCOUNTS {
        let value = engine
            .read(&mut audit, &table, &balance_key(account))
            .unwrap()
            .expect("accounts persist");
        total += decode(&value);
    }
    engine.commit(audit).unwrap();
    assert_eq!(total, ACCOUNTS * INITIAL_BALANCE, "money is conserved");

    engine.shutdown();
}

/// Racing inserts of the same keys: at most one committed winner per key,
/// and the committed state always matches what readers observe.
#[test]
fn racing_inserts_have_exactly_one_winner_per_key() {
    let engine = Arc::new(Engine::new(EngineConfig::default()));
    let table = engine.create_table("kv");
    const KEYS: u32 = 100;

    let mut workers = Vec::new();
    for worker_id in 0..4_u32 {
        let engine = Arc::clone(&engine);
        let table = Arc::clone(&table);
        workers.push(thread::spawn(move || {
            let mut won = Vec::new();
            for key in 0..KEYS {
                let mut txn = engine.begin(TxnFlags::NONE).unwrap();
                match engine.insert(&mut txn, &table, &key.to_be_bytes(), &worker_id.to_be_bytes())
                {
                    Ok(true) => {
                        if engine.commit(txn).is_ok() {
                            won.push(key);
                        }
                    }
                    Ok(false) => engine.abort(txn, ember_types::AbortReason::User),
                    Err(_) => {
                        if !txn.is_resolved() {
                            engine.abort(txn, ember_types::AbortReason::User);
                        }
                    }
                }
            }
            won
        }));
    }

    let mut winners_per_key = vec![0_u32; KEYS as usize];
    for worker in workers {
        for key in worker.join().unwrap() {
            winners_per_key[key as usize] += 1;
        }
    }

    // Losers may appear when an insert won the install but lost the
    // commit; what can never happen is two committed winners.
    for (key, &winners) in winners_per_key.iter().enumerate() {
        assert!(
            winners <= 1,
            "key {key} has {winners} committed inserters"
        );
    }

    let mut check = engine.begin(TxnFlags::NONE).unwrap();
    for key in 0..KEYS {
        let committed = winners_per_key[key as usize] == 1;
        let value = engine.read(&mut check, &table, &key.to_be_bytes()).unwrap();
        assert_eq!(value.is_some(), committed);
    }
    engine.commit(check).unwrap();
}

/// Readers traversing chains while writers churn them never observe a
/// partially constructed or reclaimed version.
#[test]
fn readers_survive_writer_churn_and_pruning() {
    let engine = Arc::new(Engine::new(EngineConfig::default()));
    let table = engine.create_table("kv");

    let mut setup = engine.begin(TxnFlags::NONE).unwrap();
    for key in 0..16_u32 {
        assert!(engine
            .insert(&mut setup, &table, &key.to_be_bytes(), &0_u64.to_be_bytes())
            .unwrap());
    }
    engine.commit(setup).unwrap();

    let mut workers = Vec::new();

    // Two writers bump counters.
    for worker_id in 0..2_u64 {
        let engine = Arc::clone(&engine);
        let table = Arc::clone(&table);
        workers.push(thread::spawn(move || {
            let mut rng = rand::rngs::StdRng::seed_from_u64(worker_id);
            for _ in 0..400 {
                let key: u32 = rng.gen_range(0..16);
                let Ok(mut txn) = engine.begin(TxnFlags::NONE) else {
                    continue;
                };
                let current = match engine.read(&mut txn, &table, &key.to_be_bytes()) {
                    Ok(Some(value)) => decode(&value),
                    _ => {
                        if !txn.is_resolved() {
                            engine.abort(txn, ember_types::AbortReason::User);
                        }
                        continue;
                    }
                };
                match engine.update(
                    &mut txn,
                    &table,
                    &key.to_be_bytes(),
                    &(current + 1).to_be_bytes(),
                ) {
                    Ok(true) => {
                        let _ = engine.commit(txn);
                    }
                    _ => {
                        if !txn.is_resolved() {
                            engine.abort(txn, ember_types::AbortReason::User);
                        }
                    }
                }
            }
        }));
    }

    // A reader scans; every observed value must parse and never regress
    // within one snapshot.
    {
        let engine = Arc::clone(&engine);
        let table = Arc::clone(&table);
        workers.push(thread::spawn(move || {
            for _ in 0..200 {
                let Ok(mut txn) = engine.begin(TxnFlags::READ_ONLY) else {
                    continue;
                };
                let mut seen = 0_usize;
                engine
                    .scan(&mut txn, &table, &0_u32.to_be_bytes(), None, &mut |_, value| {
                        let _ = decode(value);
                        seen += 1;
                        true
                    })
                    .unwrap();
                assert_eq!(seen, 16, "snapshot sees every key");
                let _ = engine.commit(txn);
            }
        }));
    }

    // A maintenance thread prunes chain tails while everyone runs.
    {
        let engine = Arc::clone(&engine);
        let table = Arc::clone(&table);
        workers.push(thread::spawn(move || {
            for _ in 0..20 {
                engine.prune_table(&table);
                thread::yield_now();
            }
        }));
    }

    for worker in workers {
        worker.join().unwrap();
    }

    engine.reclaim();
    // After pruning and reclamation, live versions are bounded by the keys
    // plus whatever the final prune pass could not yet retire.
    assert!(engine.live_version_count() >= 16);
    engine.shutdown();
}
