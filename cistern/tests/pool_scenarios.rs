//! End-to-end scenarios against the in-process mock driver.
use std::{sync::Arc, time::Duration};

use cistern::{Database, Error, ErrorKind, PoolConfig, Value, testing::MockDriver};

async fn open(scheme: &'static str, config: PoolConfig) -> Database {
    let driver = Arc::new(MockDriver::new(scheme));
    let info = cistern::ConnInfo::parse(&format!("{scheme}://localhost/app")).unwrap();
    Database::connect(driver, info, config).await.unwrap()
}

/// S1: two concurrent checkouts against a single-connection pool serialize,
/// and the second sees the same connection identity as the first.
#[tokio::test(flavor = "multi_thread")]
async fn second_checkout_waits_for_first_release_and_reuses_its_connection() {
    let config = PoolConfig {
        initial_pool_size: 1,
        max_pool_size: 1,
        max_idle_pool_size: 1,
        ..Default::default()
    };
    let db = open("s1", config).await;

    let conn = db.pool().checkout().await.unwrap();
    let first_id = conn.id();

    let pool = db.pool().clone();
    let waiter = tokio::spawn(async move {
        let started = tokio::time::Instant::now();
        let conn = pool.checkout().await.unwrap();
        (started.elapsed(), conn.id())
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(conn);

    let (elapsed, second_id) = waiter.await.unwrap();
    assert!(elapsed >= Duration::from_millis(90));
    assert_eq!(first_id, second_id);
}

/// S2: a saturated pool fails the next checkout with `PoolTimeout` once
/// `checkout_timeout` elapses.
#[tokio::test]
async fn checkout_times_out_when_pool_is_saturated() {
    let config = PoolConfig {
        initial_pool_size: 0,
        max_pool_size: 1,
        max_idle_pool_size: 1,
        checkout_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let db = open("s2", config).await;

    let _held = db.pool().checkout().await.unwrap();

    let started = tokio::time::Instant::now();
    let result = db.pool().checkout().await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(e) if matches!(e.kind(), ErrorKind::PoolTimeout)));
    assert!(elapsed >= Duration::from_millis(45));
}

/// S3: repeated prepare+exec on a growable pool caps growth at max_pool_size,
/// and returns the identical cached statement handle every time.
#[tokio::test]
async fn pool_grows_to_max_and_prepare_is_stable() {
    let config = PoolConfig {
        initial_pool_size: 0,
        max_pool_size: 2,
        max_idle_pool_size: 2,
        ..Default::default()
    };
    let db = open("s3", config).await;

    let stmt = db.prepare("select 1");
    for _ in 0..3 {
        stmt.exec(&[]).await.unwrap();
    }

    assert!(db.pool().total() <= 2);
    assert!(Arc::ptr_eq(&db.prepare("select 1"), &stmt));
}

/// S4: a retryable failure is replayed once, the broken connection it
/// happened on is discarded, and the pool returns to its steady-state size.
#[tokio::test]
async fn retry_recovers_from_one_transient_failure() {
    let config = PoolConfig {
        initial_pool_size: 1,
        max_pool_size: 1,
        max_idle_pool_size: 1,
        retry_attempts: 1,
        retry_delay: Duration::from_millis(10),
        ..Default::default()
    };
    let driver = Arc::new(MockDriver::new("s4"));
    let info = cistern::ConnInfo::parse("s4://localhost/app").unwrap();
    let db = Database::connect(driver.clone(), info, config).await.unwrap();

    assert_eq!(db.pool().total(), 1);

    let mut failed_once = false;
    let result = db
        .retry(|| {
            let first = !failed_once;
            failed_once = true;
            async move {
                if first {
                    Err(Error::from(cistern::DriverError::new("s4", "transient", true)))
                } else {
                    Ok(())
                }
            }
        })
        .await;
    assert!(result.is_ok());

    for _ in 0..200 {
        if db.pool().total() == 1 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(db.pool().total(), 1);
}

/// S4 (literal): `db.retry { db.exec("Q") }` against a driver that fails the
/// statement's first execution retries onto a fresh connection and the
/// broken one is discarded, leaving the pool back at its steady-state size.
#[tokio::test]
async fn retry_of_exec_discards_the_connection_that_failed() {
    let config = PoolConfig {
        initial_pool_size: 1,
        max_pool_size: 1,
        max_idle_pool_size: 1,
        retry_attempts: 1,
        retry_delay: Duration::from_millis(10),
        ..Default::default()
    };
    let driver = Arc::new(MockDriver::new("s4-literal"));
    driver.fail_next_execs(1);
    let info = cistern::ConnInfo::parse("s4-literal://localhost/app").unwrap();
    let db = Database::connect(driver.clone(), info, config).await.unwrap();

    let first_conn_count = driver.connect_count();
    assert_eq!(first_conn_count, 1);

    let result = db.retry(|| db.exec("Q", &[])).await;
    assert!(result.is_ok());

    for _ in 0..200 {
        if db.pool().total() == 1 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(db.pool().total(), 1);
    // the first connection was discarded and a second one built to replace it
    assert_eq!(driver.connect_count(), 2);
}

/// S5: preparing, executing, closing the result, then executing again reuses
/// the driver statement instead of building a new one.
#[tokio::test]
async fn second_execute_reuses_the_prepared_statement() {
    let config = PoolConfig {
        initial_pool_size: 1,
        max_pool_size: 1,
        max_idle_pool_size: 1,
        ..Default::default()
    };
    let db = open("s5", config).await;

    let stmt = db.prepare("select 1");
    let mut rows = stmt.fetch(&[]).await.unwrap();
    while rows.move_next().await.unwrap() {}
    rows.close().await.unwrap();

    stmt.exec(&[]).await.unwrap();

    assert_eq!(stmt.build_count(), 1);
    assert_eq!(stmt.hit_count(), 1);
}

/// S6: opening an unregistered scheme fails with `UnknownScheme`.
#[tokio::test]
async fn open_fails_for_an_unregistered_scheme() {
    let result = cistern::open("nosuch-scheme-used-only-here://x/y").await;
    assert!(matches!(result, Err(e) if matches!(e.kind(), ErrorKind::UnknownScheme(_))));
}

/// A value bound into a query round-trips through the mock driver's scripted
/// rows.
#[tokio::test]
async fn fetch_reads_back_scripted_rows() {
    let config = PoolConfig::default();
    let driver = Arc::new(MockDriver::new("rows"));
    driver.set_rows(vec![vec![Value::Int(7), Value::Text("seven".into())]]);
    let info = cistern::ConnInfo::parse("rows://localhost/app").unwrap();
    let db = Database::connect(driver, info, config).await.unwrap();

    let mut rows = db.fetch("select id, name from t", &[]).await.unwrap();
    assert!(rows.move_next().await.unwrap());
    assert!(matches!(rows.read_column(0).unwrap(), Value::Int(7)));
    assert!(!rows.move_next().await.unwrap());
    rows.close().await.unwrap();
}
