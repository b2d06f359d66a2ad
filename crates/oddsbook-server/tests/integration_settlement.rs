//! Integration tests for placement + settlement over the in-memory ledgers.
//!
//! These tests verify the end-to-end flow of:
//! - Slip validation against balance, exposure and limits
//! - Winner declaration through the match ledger
//! - Settlement payouts, exposure release and terminal status
//! - Idempotence under duplicate and concurrent settlement

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use oddsbook_common::{MarketDescriptor, MarketKind, Role, UserAccount, WagerStatus};
use oddsbook_server::locks::RowLocks;
use oddsbook_server::placement::{BetRequest, PlacementError, PlacementService};
use oddsbook_server::settlement::SettlementEngine;
use oddsbook_server::settlement::rules::RuleBook;
use oddsbook_server::state::EngineCounters;
use oddsbook_server::store::memory::{MemoryBetLedger, MemoryMatchLedger};
use oddsbook_server::store::{BetLedger, MatchLedger, WinnerDecision};
use oddsbook_server::users::UserDirectory;

struct Harness {
    users: Arc<UserDirectory>,
    bets: Arc<MemoryBetLedger>,
    matches: Arc<MemoryMatchLedger>,
    placement: PlacementService,
    engine: SettlementEngine,
}

fn market() -> MarketDescriptor {
    MarketDescriptor::new("bac-777", MarketKind::Casino, "baccarat")
}

fn harness() -> Harness {
    let counters = EngineCounters::new_shared();
    let users = Arc::new(UserDirectory::memory());
    let bets = Arc::new(MemoryBetLedger::new(Arc::clone(&users)));
    let matches = Arc::new(MemoryMatchLedger::new());
    let locks = RowLocks::new_shared();

    let placement = PlacementService::new(
        Arc::clone(&users),
        Arc::clone(&bets) as Arc<dyn BetLedger>,
        Arc::clone(&locks),
        &[market()],
        Arc::clone(&counters),
    );
    let engine = SettlementEngine::new(
        Arc::clone(&bets) as Arc<dyn BetLedger>,
        locks,
        RuleBook::with_defaults(),
        counters,
    );

    Harness {
        users,
        bets,
        matches,
        placement,
        engine,
    }
}

async fn seed_user(harness: &Harness, id: &str, balance: Decimal, exposure: Decimal, limit: Decimal) {
    let mut account = UserAccount::new(id, Role::Player, balance, limit);
    account.exposure = exposure;
    harness
        .users
        .repo(Role::Player)
        .unwrap()
        .upsert(&account)
        .await
        .unwrap();
}

async fn player(harness: &Harness, id: &str) -> UserAccount {
    harness
        .users
        .repo(Role::Player)
        .unwrap()
        .get(id)
        .await
        .unwrap()
        .unwrap()
}

/// Declare the winner on the match ledger, then settle against it.
async fn declare_and_settle(harness: &Harness, winner: &str) -> oddsbook_server::SettlementReport {
    let decision = harness
        .matches
        .declare_winner(&market(), winner)
        .await
        .unwrap();
    assert!(!matches!(decision, WinnerDecision::Conflict { .. }));
    harness.engine.settle_market(&market(), winner).await.unwrap()
}

#[tokio::test]
async fn test_stake_within_available_balance_is_accepted() {
    let h = harness();
    seed_user(&h, "alice", dec!(1000), dec!(200), dec!(500)).await;

    let wager = h
        .placement
        .place(BetRequest::new("alice", Role::Player, "bac-777", "A", dec!(250)))
        .await
        .unwrap();
    assert_eq!(wager.status, WagerStatus::Pending);

    let account = player(&h, "alice").await;
    assert_eq!(account.exposure, dec!(450));
    assert_eq!(account.balance, dec!(1000));
}

#[tokio::test]
async fn test_stake_beyond_available_balance_is_rejected() {
    let h = harness();
    seed_user(&h, "alice", dec!(1000), dec!(200), dec!(500)).await;

    let err = h
        .placement
        .place(BetRequest::new("alice", Role::Player, "bac-777", "A", dec!(900)))
        .await
        .unwrap_err();
    assert!(matches!(err, PlacementError::ExceedsAvailableBalance));
    assert_eq!(err.to_string(), "exceeds available balance");

    // Nothing held, nothing recorded.
    let account = player(&h, "alice").await;
    assert_eq!(account.exposure, dec!(200));
    let wagers = h.bets.wagers_for_user(Role::Player, "alice").await.unwrap();
    assert!(wagers.is_empty());
}

#[tokio::test]
async fn test_winning_wager_pays_profit_and_releases_exposure() {
    let h = harness();
    seed_user(&h, "bob", dec!(1000), dec!(0), dec!(10_000)).await;

    let wager = h
        .placement
        .place(
            BetRequest::new("bob", Role::Player, "bac-777", "A", dec!(100))
                .with_payout(dec!(95), dec!(100)),
        )
        .await
        .unwrap();

    let report = declare_and_settle(&h, "A").await;
    assert_eq!(report.settled, 1);
    assert_eq!(report.failed, 0);

    let account = player(&h, "bob").await;
    assert_eq!(account.balance, dec!(1095));
    assert_eq!(account.exposure, dec!(0));

    let settled = h.bets.wager(wager.id).await.unwrap().unwrap();
    assert_eq!(settled.status, WagerStatus::Won);
    let result = settled.settlement_result.unwrap();
    assert_eq!(result.winner, "A");
    assert_eq!(result.profit_loss, dec!(95));
    assert_eq!(result.stake, dec!(100));
    assert!(result.settled);
}

#[tokio::test]
async fn test_losing_wager_debits_potential_loss() {
    let h = harness();
    seed_user(&h, "bob", dec!(1000), dec!(0), dec!(10_000)).await;

    let wager = h
        .placement
        .place(
            BetRequest::new("bob", Role::Player, "bac-777", "A", dec!(100))
                .with_payout(dec!(95), dec!(100)),
        )
        .await
        .unwrap();

    let report = declare_and_settle(&h, "B").await;
    assert_eq!(report.settled, 1);

    let account = player(&h, "bob").await;
    assert_eq!(account.balance, dec!(900));
    assert_eq!(account.exposure, dec!(0));

    let settled = h.bets.wager(wager.id).await.unwrap().unwrap();
    assert_eq!(settled.status, WagerStatus::Lost);
    assert_eq!(settled.settlement_result.unwrap().profit_loss, dec!(-100));
}

#[tokio::test]
async fn test_duplicate_declaration_settles_zero_additional() {
    let h = harness();
    seed_user(&h, "bob", dec!(1000), dec!(0), dec!(10_000)).await;

    h.placement
        .place(
            BetRequest::new("bob", Role::Player, "bac-777", "A", dec!(100))
                .with_payout(dec!(95), dec!(100)),
        )
        .await
        .unwrap();

    let first = declare_and_settle(&h, "A").await;
    assert_eq!(first.settled, 1);

    // The second delivery of the same winner finds nothing pending.
    let decision = h.matches.declare_winner(&market(), "A").await.unwrap();
    assert!(matches!(decision, WinnerDecision::AlreadyDeclared));
    let second = h.engine.settle_market(&market(), "A").await.unwrap();
    assert_eq!(second.settled, 0);
    assert_eq!(second.skipped, 0);

    let account = player(&h, "bob").await;
    assert_eq!(account.balance, dec!(1095));
}

#[tokio::test]
async fn test_concurrent_settlement_commits_once() {
    let h = harness();
    seed_user(&h, "bob", dec!(1000), dec!(0), dec!(10_000)).await;

    h.placement
        .place(
            BetRequest::new("bob", Role::Player, "bac-777", "A", dec!(100))
                .with_payout(dec!(95), dec!(100)),
        )
        .await
        .unwrap();
    h.matches.declare_winner(&market(), "A").await.unwrap();

    let m1 = market();
    let m2 = market();
    let (first, second) = tokio::join!(
        h.engine.settle_market(&m1, "A"),
        h.engine.settle_market(&m2, "A"),
    );
    let first = first.unwrap();
    let second = second.unwrap();

    assert_eq!(first.settled + second.settled, 1);
    assert_eq!(first.failed + second.failed, 0);

    // Funds moved exactly once.
    let account = player(&h, "bob").await;
    assert_eq!(account.balance, dec!(1095));
    assert_eq!(account.exposure, dec!(0));
}

#[tokio::test]
async fn test_mixed_book_settles_both_sides() {
    let h = harness();
    seed_user(&h, "bob", dec!(1000), dec!(0), dec!(10_000)).await;
    seed_user(&h, "cara", dec!(500), dec!(0), dec!(10_000)).await;

    h.placement
        .place(
            BetRequest::new("bob", Role::Player, "bac-777", "A", dec!(100))
                .with_payout(dec!(95), dec!(100)),
        )
        .await
        .unwrap();
    h.placement
        .place(
            BetRequest::new("cara", Role::Player, "bac-777", "B", dec!(50))
                .with_payout(dec!(45), dec!(50)),
        )
        .await
        .unwrap();

    let report = declare_and_settle(&h, "A").await;
    assert_eq!(report.settled, 2);

    let bob = player(&h, "bob").await;
    assert_eq!(bob.balance, dec!(1095));
    let cara = player(&h, "cara").await;
    assert_eq!(cara.balance, dec!(450));
    assert_eq!(cara.exposure, dec!(0));
}

#[tokio::test]
async fn test_conflicting_winner_is_never_applied() {
    let h = harness();
    seed_user(&h, "bob", dec!(1000), dec!(0), dec!(10_000)).await;

    h.placement
        .place(
            BetRequest::new("bob", Role::Player, "bac-777", "B", dec!(100))
                .with_payout(dec!(95), dec!(100)),
        )
        .await
        .unwrap();

    let first = declare_and_settle(&h, "A").await;
    assert_eq!(first.settled, 1);

    // A different winner later is a conflict; the original outcome stands.
    let decision = h.matches.declare_winner(&market(), "B").await.unwrap();
    match decision {
        WinnerDecision::Conflict { existing } => assert_eq!(existing, "A"),
        other => panic!("expected a conflict, got {:?}", other),
    }
    let row = h.matches.market("bac-777").await.unwrap().unwrap();
    assert_eq!(row.declared_winner.as_deref(), Some("A"));

    let account = player(&h, "bob").await;
    assert_eq!(account.balance, dec!(900));
}

#[tokio::test]
async fn test_locked_account_cannot_place_but_still_settles() {
    let h = harness();
    let mut account = UserAccount::new("dan", Role::Player, dec!(1000), dec!(10_000));
    h.users
        .repo(Role::Player)
        .unwrap()
        .upsert(&account)
        .await
        .unwrap();

    h.placement
        .place(
            BetRequest::new("dan", Role::Player, "bac-777", "A", dec!(100))
                .with_payout(dec!(95), dec!(100)),
        )
        .await
        .unwrap();

    // Lock after placement; the open wager settles regardless.
    account.betting_locked = true;
    account.exposure = dec!(100);
    h.users
        .repo(Role::Player)
        .unwrap()
        .upsert(&account)
        .await
        .unwrap();

    let err = h
        .placement
        .place(BetRequest::new("dan", Role::Player, "bac-777", "A", dec!(10)))
        .await
        .unwrap_err();
    assert!(matches!(err, PlacementError::AccountLocked));

    let report = declare_and_settle(&h, "A").await;
    assert_eq!(report.settled, 1);
    let account = player(&h, "dan").await;
    assert_eq!(account.balance, dec!(1095));
    assert_eq!(account.exposure, dec!(0));
}
