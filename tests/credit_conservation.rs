use std::sync::Arc;

use tally_credit::{
    AccountConfig, CreditConfig, CreditLedger, FinalizeOutcome, FinalizeRequest, LotExpirySweep,
    LotSource, MicroUsd, ReconciliationWorker, SqliteStore,
};

fn micros(value: i64) -> MicroUsd {
    MicroUsd::from_micros(value)
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

async fn open_ledger() -> (tempfile::TempDir, Arc<CreditLedger>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::new(dir.path().join("credit.sqlite"));
    let config = CreditConfig {
        accounts: vec![AccountConfig::new("guild-1")],
        ..CreditConfig::default()
    };
    let ledger = Arc::new(CreditLedger::new(config, store));
    ledger.init().await.expect("init");
    (dir, ledger)
}

async fn finalize(ledger: &CreditLedger, finalization_id: &str, cost: i64) -> FinalizeOutcome {
    let fence = ledger.acquire_fence("guild-1").await.expect("fence");
    ledger
        .finalize(FinalizeRequest {
            account_id: "guild-1".to_string(),
            finalization_id: finalization_id.to_string(),
            fence_token: fence,
            cost_micros: micros(cost),
            reservation_id: None,
            cap_policy: None,
        })
        .await
        .expect("finalize")
}

/// sum(lot amounts) + sum(entry amounts) == sum(active lot balances), and the
/// active balance equals minted credit minus finalized spend minus expired
/// write-offs, across mint, finalize and sweep.
#[tokio::test]
async fn conservation_identity_survives_mint_finalize_and_sweep() {
    let (_dir, ledger) = open_ledger().await;
    let soon = now_ms() + 60_000;
    let lot_a = ledger
        .mint("guild-1", micros(600_000), LotSource::Seed, Some(soon))
        .await
        .expect("mint a");
    let lot_b = ledger
        .mint("guild-1", micros(400_000), LotSource::Purchase, None)
        .await
        .expect("mint b");

    // Spans both lots: drains A (earliest expiry) then part of B.
    let outcome = finalize(&ledger, "f1", 700_000).await;
    let FinalizeOutcome::Finalized { entries, .. } = outcome else {
        panic!("expected finalized, got {outcome:?}");
    };
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].lot_id, lot_a.lot_id);
    assert_eq!(entries[0].amount_micros, micros(-600_000));
    assert_eq!(entries[1].lot_id, lot_b.lot_id);
    assert_eq!(entries[1].amount_micros, micros(-100_000));

    let sweep = LotExpirySweep::new(ledger.clone());
    let report = sweep.run_once_at(soon + 1_000).await.expect("sweep");
    // Lot A was fully consumed; it is retired with nothing to write off.
    assert_eq!(report.expired_lots, 1);
    assert_eq!(report.expired_micros, MicroUsd::ZERO);

    let store = ledger.store();
    let lots = store.list_lots("guild-1").await.expect("lots");
    let amount_sum: i64 = lots.iter().map(|lot| lot.amount_micros.micros()).sum();
    let mut entry_sum = 0i64;
    for entry in store.entries_for_reference("f1").await.expect("entries") {
        entry_sum += entry.amount_micros.micros();
    }
    for lot in &lots {
        for entry in store
            .entries_for_reference(&format!("sweep:lot:{}", lot.lot_id))
            .await
            .expect("entries")
        {
            entry_sum += entry.amount_micros.micros();
        }
    }

    let balance = ledger.balance("guild-1").await.expect("balance");
    assert_eq!(amount_sum + entry_sum, balance.micros());
    assert_eq!(balance, micros(300_000));

    // Durable committed spend matches the debits taken from the lots.
    let committed = store.committed_total("guild-1").await.expect("committed");
    assert_eq!(committed, micros(700_000));
}

#[tokio::test]
async fn balances_never_go_negative_under_over_debit_attempts() {
    let (_dir, ledger) = open_ledger().await;
    ledger
        .mint("guild-1", micros(250_000), LotSource::Seed, None)
        .await
        .expect("mint");

    finalize(&ledger, "f1", 200_000).await;
    let err = ledger
        .store()
        .debit_lots("guild-1", micros(100_000), "over")
        .await;
    assert!(err.is_err());
    let balance = ledger.balance("guild-1").await.expect("balance");
    assert_eq!(balance, micros(50_000));

    let lots = ledger.store().list_lots("guild-1").await.expect("lots");
    for lot in lots {
        let mut lot_balance = lot.amount_micros.micros();
        for entry in ledger
            .store()
            .entries_for_reference("f1")
            .await
            .expect("entries")
        {
            if entry.lot_id == lot.lot_id {
                lot_balance += entry.amount_micros.micros();
            }
        }
        assert!(lot_balance >= 0);
    }
}

#[tokio::test]
async fn daily_counter_chain_tracks_finalized_spend() {
    let (_dir, ledger) = open_ledger().await;
    ledger
        .mint("guild-1", micros(1_000_000), LotSource::Seed, None)
        .await
        .expect("mint");

    finalize(&ledger, "f1", 150_000).await;
    finalize(&ledger, "f2", 100_000).await;

    let date = time_today();
    let total = ledger
        .daily()
        .get("guild-1", &date)
        .await
        .expect("daily total");
    assert_eq!(total, micros(250_000));

    // Unknown account reads as confirmed-empty zero, not an error.
    let empty = ledger
        .daily()
        .get("guild-9", &date)
        .await
        .expect("empty total");
    assert_eq!(empty, MicroUsd::ZERO);
}

#[tokio::test]
async fn reconciliation_without_cache_tier_is_a_safe_no_op() {
    let (_dir, ledger) = open_ledger().await;
    ledger
        .mint("guild-1", micros(1_000_000), LotSource::Seed, None)
        .await
        .expect("mint");
    finalize(&ledger, "f1", 100_000).await;
    finalize(&ledger, "f2", 100_000).await;

    let worker = ReconciliationWorker::new(ledger.clone());
    let report = worker.run_once().await.expect("reconcile");
    assert_eq!(report.accounts, 1);
    assert_eq!(report.corrected_events, 0);

    // Cursors are untouched without a cache tier to replay into.
    assert_eq!(
        ledger
            .store()
            .reconciliation_cursor("guild-1")
            .await
            .expect("cursor"),
        0
    );
}

#[tokio::test]
async fn usage_events_paginate_in_fence_order() {
    let (_dir, ledger) = open_ledger().await;
    ledger
        .mint("guild-1", micros(1_000_000), LotSource::Seed, None)
        .await
        .expect("mint");
    for (id, cost) in [("f1", 10_000), ("f2", 20_000), ("f3", 30_000)] {
        finalize(&ledger, id, cost).await;
    }

    let store = ledger.store();
    let first_page = store
        .usage_events_after("guild-1", 0, 2)
        .await
        .expect("page 1");
    assert_eq!(first_page.len(), 2);
    assert!(first_page[0].fence_token < first_page[1].fence_token);

    let second_page = store
        .usage_events_after("guild-1", first_page[1].event_id, 2)
        .await
        .expect("page 2");
    assert_eq!(second_page.len(), 1);
    assert_eq!(second_page[0].finalization_id, "f3");

    store
        .advance_reconciliation_cursor("guild-1", second_page[0].event_id)
        .await
        .expect("advance");
    assert!(store
        .usage_events_after(
            "guild-1",
            store
                .reconciliation_cursor("guild-1")
                .await
                .expect("cursor"),
            16
        )
        .await
        .expect("drained")
        .is_empty());
}

fn time_today() -> String {
    let now = time::OffsetDateTime::now_utc();
    let date = now.date();
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}
