//! SqliteStore tests against a throwaway database file.

use std::collections::BTreeMap;
use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::PathBuf;
use tempfile::TempDir;

use cat_engine::cat::config::{AgentConfig, CatConfig};
use cat_engine::cat::decision::ItemSelectionAgent;
use cat_engine::cat::persistence::{AbilityStore, AgentStateStore, ItemBank, ResponseSource};
use cat_engine::cat::types::{AbilityEstimate, Item, ItemParams, Response};
use cat_engine::db::SqliteStore;
use cat_engine::AdaptiveTestingController;

async fn create_test_sqlite_pool(db_path: PathBuf) -> Result<SqlitePool, sqlx::Error> {
    use std::str::FromStr;

    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(30));

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
}

async fn setup() -> (TempDir, SqliteStore) {
    let dir = TempDir::new().expect("tempdir");
    let pool = create_test_sqlite_pool(dir.path().join("cat.db"))
        .await
        .expect("pool");
    let store = SqliteStore::from_pool(pool);
    store.migrate().await.expect("migrate");
    (dir, store)
}

fn item(id: i64, category_id: i64, b: f64) -> Item {
    Item {
        id,
        category_id,
        params: ItemParams::new(1.1, b, 0.2),
        elo_difficulty: 1500.0 + 80.0 * b,
    }
}

#[tokio::test]
async fn migrate_is_repeatable() {
    let (_dir, store) = setup().await;
    store.migrate().await.unwrap();
    assert!(store.get_item_pool(&[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn item_pool_round_trip() {
    let (_dir, store) = setup().await;
    store
        .insert_items(&[item(3, 2, 0.5), item(1, 1, -1.0), item(2, 1, 1.0)])
        .await
        .unwrap();

    let pool = store.get_item_pool(&[1]).await.unwrap();
    assert_eq!(pool.iter().map(|i| i.id).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(pool[0].params, ItemParams::new(1.1, -1.0, 0.2));

    let all = store.get_item_pool(&[1, 2]).await.unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn responses_come_back_in_recorded_order() {
    let (_dir, store) = setup().await;
    let a = item(1, 1, 0.0);
    let b = item(2, 2, 0.0);
    store.record_response("u1", &Response::for_item(&a, true, 4.0)).await.unwrap();
    store.record_response("u1", &Response::for_item(&b, false, 9.0)).await.unwrap();
    store.record_response("u1", &Response::for_item(&a, false, 2.5)).await.unwrap();
    store.record_response("u2", &Response::for_item(&a, true, 1.0)).await.unwrap();

    let all = store.get_responses("u1", None).await.unwrap();
    assert_eq!(all.iter().map(|r| r.item_id).collect::<Vec<_>>(), vec![1, 2, 1]);

    let scoped = store.get_responses("u1", Some(1)).await.unwrap();
    assert_eq!(scoped.iter().map(|r| r.correct).collect::<Vec<_>>(), vec![true, false]);
    assert_eq!(scoped[1].time_spent, 2.5);
}

#[tokio::test]
async fn ability_rows_upsert() {
    let (_dir, store) = setup().await;
    let mut estimate = AbilityEstimate::new("u1", 7);
    store.save_ability(&estimate).await.unwrap();

    estimate.irt_theta = -0.75;
    estimate.elo_rating = 1488.5;
    estimate.elo_time_rating = Some(1491.0);
    store.save_ability(&estimate).await.unwrap();

    let loaded = store.load_ability("u1", 7).await.unwrap().unwrap();
    assert_eq!(loaded, estimate);
    assert_eq!(store.load_abilities("u1").await.unwrap().len(), 1);
    assert!(store.load_ability("u1", 8).await.unwrap().is_none());
}

#[tokio::test]
async fn agent_state_last_write_wins() {
    let (_dir, store) = setup().await;
    assert!(store.load_agent_state().await.unwrap().is_none());

    let config = AgentConfig {
        category_slots: 2,
        hidden_layers: vec![4],
        seed: Some(3),
        ..Default::default()
    };
    let mut agent = ItemSelectionAgent::new(config);
    store.save_agent_state(&agent.snapshot()).await.unwrap();
    agent.set_epsilon(0.5);
    store.save_agent_state(&agent.snapshot()).await.unwrap();

    let loaded = store.load_agent_state().await.unwrap().unwrap();
    assert!((loaded.epsilon - 0.5).abs() < 1e-12);
    let count: i64 = sqlx::query_scalar(r#"SELECT COUNT(*) FROM "agent_state""#)
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn controller_runs_against_sqlite() {
    let (_dir, store) = setup().await;
    store
        .insert_items(&(0..12).map(|i| item(i, 1 + i % 2, -1.5 + i as f64 * 0.25)).collect::<Vec<_>>())
        .await
        .unwrap();
    let first = item(0, 1, -1.5);
    for correct in [true, true, false, true] {
        store.record_response("u1", &Response::for_item(&first, correct, 6.0)).await.unwrap();
    }

    let store = Arc::new(store);
    let engine = AdaptiveTestingController::bootstrap(CatConfig::default(), store.clone()).await;

    let thetas = engine.estimate_ability("u1", None).await.unwrap();
    assert!(thetas.contains_key(&1));

    let plan = engine
        .select_next_items("u1", &[1, 2], &BTreeMap::new(), 6)
        .await
        .unwrap();
    assert_eq!(plan.len(), 6);

    engine.checkpoint().await.unwrap();
    assert!(store.load_agent_state().await.unwrap().is_some());
}
