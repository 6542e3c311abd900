use std::time::Duration;

use super::{
    pool::ServerSessionPool,
    ClientSession,
    ServerSession,
    Transaction,
    TransactionState,
};
use crate::{
    client::options::{ClientOptions, ServerAddress},
    Client,
};

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(30 * 60));

#[tokio::test(start_paused = true)]
async fn expired_sessions_are_not_returned() {
    let pool = ServerSessionPool::new();
    let session = ServerSession::new();
    let id = session.id.clone();
    pool.check_in(session, TIMEOUT).await;

    // Just under the expiration cutoff (timeout minus one minute), the session is reusable.
    tokio::time::advance(Duration::from_secs(30 * 60 - 61)).await;
    let session = pool.check_out(TIMEOUT).await;
    assert_eq!(session.id, id);
    pool.check_in(session, TIMEOUT).await;

    // Past the cutoff, the record is discarded and a fresh session is minted.
    tokio::time::advance(Duration::from_secs(2)).await;
    let session = pool.check_out(TIMEOUT).await;
    assert_ne!(session.id, id);
    assert_eq!(pool.len().await, 0);
}

#[tokio::test]
async fn sessions_are_reused_most_recently_returned_first() {
    let pool = ServerSessionPool::new();

    let first = ServerSession::new();
    let second = ServerSession::new();
    let (first_id, second_id) = (first.id.clone(), second.id.clone());

    pool.check_in(first, TIMEOUT).await;
    pool.check_in(second, TIMEOUT).await;

    assert_eq!(pool.check_out(TIMEOUT).await.id, second_id);
    assert_eq!(pool.check_out(TIMEOUT).await.id, first_id);
}

#[tokio::test]
async fn dirty_sessions_are_discarded() {
    let pool = ServerSessionPool::new();

    let mut session = ServerSession::new();
    session.dirty = true;
    let id = session.id.clone();
    pool.check_in(session, TIMEOUT).await;

    assert!(!pool.contains(&id).await);
    assert_ne!(pool.check_out(TIMEOUT).await.id, id);
}

#[tokio::test]
async fn cleared_pool_mints_fresh_ids() {
    let pool = ServerSessionPool::new();

    let session = pool.check_out(TIMEOUT).await;
    let id = session.id.clone();
    pool.check_in(session, TIMEOUT).await;

    // A reconnect clears the pool; the next session must not reuse the old id.
    pool.clear().await;
    let session = pool.check_out(TIMEOUT).await;
    assert_ne!(session.id, id);
}

#[tokio::test]
async fn txn_numbers_strictly_increase() {
    let options = ClientOptions::builder()
        .hosts(vec![ServerAddress::new("240.0.0.1", 27017)])
        .build();
    let client = Client::with_options(options).unwrap();

    let mut session = ClientSession::new(client, None, false).await;
    let first = session.get_and_increment_txn_number();
    let second = session.get_and_increment_txn_number();
    let third = session.get_and_increment_txn_number();

    assert!(first < second && second < third);
    assert_eq!(session.txn_number(), third);

    assert!(!session.is_dirty());
    session.mark_dirty();
    assert!(session.is_dirty());
}

#[test]
fn transaction_state_machine() {
    let mut transaction = Transaction::default();
    assert_eq!(transaction.state, TransactionState::None);

    transaction.start(None);
    assert_eq!(transaction.state, TransactionState::Starting);
    assert!(!transaction.has_operations);

    transaction.state = TransactionState::InProgress;
    transaction.has_operations = true;

    transaction.commit(true);
    assert_eq!(
        transaction.state,
        TransactionState::Committed {
            data_committed: true
        }
    );

    transaction.reset();
    assert_eq!(transaction.state, TransactionState::None);
    assert!(!transaction.has_operations);

    transaction.start(None);
    transaction.abort();
    assert_eq!(transaction.state, TransactionState::Aborted);
}
