//! Cart hold lifecycle: place, replace, extend, convert, release, sweep.

#![allow(clippy::expect_used, clippy::unwrap_used)] // Test code can use unwrap/expect

mod common;

use chrono::Duration;
use common::Harness;
use std::time::Duration as StdDuration;
use stockledger_core::{CartId, LedgerError, ReservationState};
use stockledger_runtime::{EngineConfig, ExpirySweeper, ReleaseTarget};
use stockledger_testing::fixtures::{self, line, order};
use tokio::sync::broadcast;

#[tokio::test]
async fn hold_survives_until_swept_after_expiry() {
    let h = Harness::new();
    let key = h.stocked(10);
    let cart_line = fixtures::cart_line();

    let hold = h.holds.reserve(cart_line, line(key, 2), h.actor).await.unwrap();
    assert_eq!(hold.expires_at - hold.reserved_at, Duration::minutes(30));
    assert_eq!(h.record(key).reserved_quantity, 2);

    let report = h.holds.sweep_expired(h.actor).await.unwrap();
    assert_eq!(report.released, 0);
    assert_eq!(h.record(key).reserved_quantity, 2);

    // Lazy expiry: past expires_at the hold still counts until swept.
    h.clock.advance(Duration::minutes(31));
    assert_eq!(h.record(key).reserved_quantity, 2);

    let report = h.holds.sweep_expired(h.actor).await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.released, 1);
    assert_eq!(h.record(key).reserved_quantity, 0);
    assert!(h.store().holds().is_empty());
}

#[tokio::test]
async fn hold_exactly_at_expiry_is_not_swept() {
    let h = Harness::new();
    let key = h.stocked(10);

    let hold = h.holds.reserve(fixtures::cart_line(), line(key, 1), h.actor).await.unwrap();
    h.clock.set(hold.expires_at);

    let report = h.holds.sweep_expired(h.actor).await.unwrap();
    assert_eq!(report.released, 0);
}

#[tokio::test]
async fn replacing_a_hold_frees_the_old_units_first() {
    let h = Harness::new();
    let key = h.stocked(5);
    let cart_line = fixtures::cart_line();

    let first = h.holds.reserve(cart_line, line(key, 4), h.actor).await.unwrap();
    // 5 units, 4 already held by this same line: asking for 5 must succeed.
    let second = h.holds.reserve(cart_line, line(key, 5), h.actor).await.unwrap();

    assert_ne!(first.reservation_id, second.reservation_id);
    assert_eq!(h.record(key).reserved_quantity, 5);
    assert_eq!(h.store().holds().len(), 1);
}

#[tokio::test]
async fn replacing_a_hold_can_move_it_to_another_item() {
    let h = Harness::new();
    let old = h.stocked(5);
    let new = h.stocked(5);
    let cart_line = fixtures::cart_line();

    h.holds.reserve(cart_line, line(old, 3), h.actor).await.unwrap();
    h.holds.reserve(cart_line, line(new, 2), h.actor).await.unwrap();

    assert_eq!(h.record(old).reserved_quantity, 0);
    assert_eq!(h.record(new).reserved_quantity, 2);
}

#[tokio::test]
async fn failed_replacement_keeps_the_old_hold() {
    let h = Harness::new();
    let key = h.stocked(5);
    let cart_line = fixtures::cart_line();

    let first = h.holds.reserve(cart_line, line(key, 2), h.actor).await.unwrap();
    let err = h.holds.reserve(cart_line, line(key, 6), h.actor).await.unwrap_err();

    assert!(matches!(err, LedgerError::InsufficientStock { .. }));
    assert_eq!(h.record(key).reserved_quantity, 2);
    assert_eq!(h.store().holds(), vec![first]);
}

#[tokio::test]
async fn hold_needs_sellable_stock() {
    let h = Harness::new();
    let key = h.stocked(3);
    h.engine
        .reserve_for_order(&order("1"), &[line(key, 2)], h.actor, false)
        .await
        .unwrap();

    let err = h
        .holds
        .reserve(fixtures::cart_line(), line(key, 2), h.actor)
        .await
        .unwrap_err();
    let LedgerError::InsufficientStock { shortfalls } = err else {
        panic!("expected InsufficientStock");
    };
    assert_eq!(shortfalls[0].sellable, 1);
}

#[tokio::test]
async fn release_clears_the_hold_and_is_idempotent() {
    let h = Harness::new();
    let key = h.stocked(10);
    let cart_line = fixtures::cart_line();
    h.holds.reserve(cart_line, line(key, 3), h.actor).await.unwrap();

    let released = h.holds.release(cart_line.cart_line_id, h.actor).await.unwrap();
    assert_eq!(released.unwrap().reserved_quantity, 0);
    assert!(h.store().holds().is_empty());

    let entries = h.ledger_len();
    assert!(h.holds.release(cart_line.cart_line_id, h.actor).await.unwrap().is_none());
    assert_eq!(h.ledger_len(), entries);
}

#[tokio::test]
async fn engine_release_accepts_cart_holds() {
    let h = Harness::new();
    let key = h.stocked(10);
    let cart_line = fixtures::cart_line();
    h.holds.reserve(cart_line, line(key, 3), h.actor).await.unwrap();

    let released = h
        .engine
        .release_reservation(&ReleaseTarget::CartHold(cart_line.cart_line_id), h.actor)
        .await
        .unwrap();
    assert_eq!(released.len(), 1);
    assert_eq!(h.record(key).reserved_quantity, 0);
}

#[tokio::test]
async fn extend_pushes_every_hold_of_the_cart() {
    let h = Harness::new();
    let key = h.stocked(10);
    let cart = CartId::new();
    let a = h.holds.reserve(fixtures::cart_line_on(cart), line(key, 1), h.actor).await.unwrap();
    let b = h.holds.reserve(fixtures::cart_line_on(cart), line(key, 1), h.actor).await.unwrap();
    let elsewhere = h.holds.reserve(fixtures::cart_line(), line(key, 1), h.actor).await.unwrap();

    let extended = h.holds.extend(cart, Duration::minutes(15)).await.unwrap();
    assert_eq!(extended, 2);

    for hold in h.store().holds() {
        if hold.cart_line_id == elsewhere.cart_line_id {
            assert_eq!(hold.expires_at, elsewhere.expires_at);
        } else {
            let original = if hold.cart_line_id == a.cart_line_id { &a } else { &b };
            assert_eq!(hold.expires_at, original.expires_at + Duration::minutes(15));
        }
    }

    // An extended hold outlives the original deadline.
    h.clock.advance(Duration::minutes(31));
    let report = h.holds.sweep_expired(h.actor).await.unwrap();
    assert_eq!(report.released, 1);
    assert_eq!(h.record(key).reserved_quantity, 2);
}

#[tokio::test]
async fn extending_an_empty_cart_touches_nothing() {
    let h = Harness::new();
    assert_eq!(h.holds.extend(CartId::new(), Duration::minutes(5)).await.unwrap(), 0);
    assert!(h.holds.extend(CartId::new(), Duration::zero()).await.is_err());
}

#[tokio::test]
async fn convert_moves_holds_into_order_reservations() {
    let h = Harness::new();
    let shirt = h.stocked(10);
    let mug = h.stocked(10);
    let cart = CartId::new();
    h.holds.reserve(fixtures::cart_line_on(cart), line(shirt, 2), h.actor).await.unwrap();
    h.holds.reserve(fixtures::cart_line_on(cart), line(mug, 1), h.actor).await.unwrap();
    let o = order("5001");

    let reservations = h.holds.convert_to_order(cart, &o, h.actor).await.unwrap();
    assert_eq!(reservations.len(), 2);
    assert!(reservations.iter().all(|r| r.state == ReservationState::Active));
    assert!(h.store().holds().is_empty());
    // Units changed owner, not quantity.
    assert_eq!(h.record(shirt).reserved_quantity, 2);
    assert_eq!(h.record(mug).reserved_quantity, 1);

    // Expired holds are gone, so the sweep cannot take the order's units.
    h.clock.advance(Duration::hours(2));
    assert_eq!(h.holds.sweep_expired(h.actor).await.unwrap().examined, 0);

    h.engine
        .fulfill_order(&o, &[line(shirt, 2), line(mug, 1)], h.actor, false)
        .await
        .unwrap();
    assert_eq!(h.record(shirt).available_quantity, 8);
    assert_eq!(h.record(shirt).reserved_quantity, 0);
}

#[tokio::test]
async fn converted_order_can_be_released() {
    let h = Harness::new();
    let key = h.stocked(10);
    let cart = CartId::new();
    h.holds.reserve(fixtures::cart_line_on(cart), line(key, 4), h.actor).await.unwrap();
    let o = order("5002");
    h.holds.convert_to_order(cart, &o, h.actor).await.unwrap();

    let released = h
        .engine
        .release_reservation(&ReleaseTarget::Order(o), h.actor)
        .await
        .unwrap();
    assert_eq!(released[0].reserved_quantity, 0);
}

#[tokio::test]
async fn concurrent_sweeps_release_each_hold_once() {
    let h = Harness::new();
    let key = h.stocked(100);
    for _ in 0..10 {
        h.holds.reserve(fixtures::cart_line(), line(key, 1), h.actor).await.unwrap();
    }
    // Units held by an order must survive the sweeps.
    h.engine
        .reserve_for_order(&order("keep"), &[line(key, 5)], h.actor, false)
        .await
        .unwrap();
    h.clock.advance(Duration::hours(1));

    let sweeps = (0..4).map(|_| {
        let holds = h.holds.clone();
        let actor = h.actor;
        tokio::spawn(async move { holds.sweep_expired(actor).await.unwrap() })
    });
    let reports = futures::future::join_all(sweeps).await;
    let released: usize = reports.into_iter().map(|r| r.unwrap().released).sum();

    assert_eq!(released, 10);
    assert_eq!(h.record(key).reserved_quantity, 5);
}

#[tokio::test]
async fn sweeper_task_stops_on_shutdown() {
    let h = Harness::new();
    let key = h.stocked(10);
    h.holds.reserve(fixtures::cart_line(), line(key, 3), h.actor).await.unwrap();
    h.clock.advance(Duration::hours(1));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let sweeper = ExpirySweeper::new(h.holds.clone(), h.actor, StdDuration::from_millis(10), shutdown_rx);
    let handle = sweeper.spawn();

    // The first tick fires immediately.
    for _ in 0..50 {
        if h.record(key).reserved_quantity == 0 {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    assert_eq!(h.record(key).reserved_quantity, 0);

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(StdDuration::from_secs(1), handle)
        .await
        .expect("sweeper did not stop")
        .unwrap();
}

#[tokio::test]
async fn invalid_hold_requests_are_rejected() {
    let h = Harness::new();
    let key = h.stocked(10);

    let zero = h.holds.reserve(fixtures::cart_line(), line(key, 0), h.actor).await;
    assert!(matches!(zero, Err(LedgerError::InvalidRequest(_))));

    let no_ttl = h
        .holds
        .reserve_for(fixtures::cart_line(), line(key, 1), h.actor, Duration::zero())
        .await;
    assert!(matches!(no_ttl, Err(LedgerError::InvalidRequest(_))));
}

#[tokio::test]
async fn oversized_extension_is_rejected_and_leaves_holds_alone() {
    let h = Harness::new();
    let key = h.stocked(10);
    let cart = CartId::new();
    let hold = h.holds.reserve(fixtures::cart_line_on(cart), line(key, 1), h.actor).await.unwrap();

    let err = h
        .holds
        .extend(cart, Duration::days(365 * 280_000))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidRequest(_)), "got {err:?}");
    assert_eq!(h.store().holds()[0].expires_at, hold.expires_at);
}

#[tokio::test]
async fn oversized_ttl_is_rejected() {
    let h = Harness::new();
    let key = h.stocked(10);

    let err = h
        .holds
        .reserve_for(fixtures::cart_line(), line(key, 1), h.actor, Duration::days(365 * 280_000))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidRequest(_)), "got {err:?}");

    let h = Harness::with_config(EngineConfig {
        cart_hold_ttl_minutes: i64::MAX,
        ..EngineConfig::default()
    });
    let key = h.stocked(10);
    let err = h.holds.reserve(fixtures::cart_line(), line(key, 1), h.actor).await.unwrap_err();
    assert!(matches!(err, LedgerError::InvalidRequest(_)), "got {err:?}");
    assert_eq!(h.record(key).reserved_quantity, 0);
    assert!(h.store().holds().is_empty());
}

#[tokio::test]
async fn one_sweep_drains_a_backlog_larger_than_a_batch() {
    let h = Harness::with_config(EngineConfig {
        sweep_batch_size: 3,
        ..EngineConfig::default()
    });
    let key = h.stocked(20);
    for _ in 0..8 {
        h.holds.reserve(fixtures::cart_line(), line(key, 1), h.actor).await.unwrap();
    }
    h.clock.advance(Duration::hours(1));

    let report = h.holds.sweep_expired(h.actor).await.unwrap();
    assert_eq!(report.examined, 8);
    assert_eq!(report.released, 8);
    assert_eq!(report.failed, 0);
    assert_eq!(h.record(key).reserved_quantity, 0);
    assert!(h.store().holds().is_empty());
}
