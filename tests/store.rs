use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use record_store::prelude::*;
use serde_json::json;

fn record(id: &str, cost: f64) -> Record {
    RecordDraft::new(id, SourceSystem::Aws)
        .service("EC2")
        .region("us-east-1")
        .cost(cost)
        .build()
        .unwrap()
}

fn quiet_config() -> StoreConfig {
    StoreConfig::builder()
        .debounce(Duration::from_secs(10))
        .build()
        .unwrap()
}

#[tokio::test]
async fn saved_records_survive_a_new_session() -> Result<(), Box<dyn std::error::Error>> {
    for n in [0usize, 1, 999, 1001, 50_000] {
        let backend = Arc::new(MemoryStore::new());
        let store = RecordStore::open(backend.clone(), quiet_config());

        let records: Vec<Record> = (0..n)
            .map(|i| {
                record(&format!("res-{i}"), i as f64 * 0.5)
                    .with_dependencies([format!("res-{}", i + 1)])
            })
            .collect();
        let originals: HashMap<String, Record> = records.iter().map(|r| (r.id().to_string(), r.clone())).collect();

        let counts = store.save_many_immediate(records).await?;
        assert_eq!(counts.iter().sum::<usize>(), n, "saved {n}");
        assert_eq!(backend.len(), n);

        let reopened = RecordStore::open(backend.clone(), quiet_config());
        assert_eq!(reopened.ensure_loaded().await?, n);
        let loaded = reopened.find_all().await?;
        assert_eq!(loaded.len(), n, "loaded {n}");
        for record in loaded {
            assert_eq!(Some(&*record), originals.get(record.id()));
        }
    }
    Ok(())
}

#[tokio::test]
async fn immediate_saves_are_batched() -> Result<(), Box<dyn std::error::Error>> {
    let backend = Arc::new(MemoryStore::new());
    let config = StoreConfig::builder()
        .flush_batch_size(2)
        .debounce(Duration::from_secs(10))
        .build()?;
    let store = RecordStore::open(backend.clone(), config);
    backend.fail_writes_for("record:c");

    let counts = store
        .save_many_immediate(["a", "b", "c", "d", "e"].iter().map(|id| record(id, 1.0)).collect())
        .await?;
    assert_eq!(counts, vec![2, 1, 1]);
    assert_eq!(store.pending_writes(), 1);
    assert!(backend.peek("record:c").is_none());
    assert_eq!(store.find_by_id("c").await?.map(|r| r.monthly_cost()), Some(1.0));

    backend.heal();
    store.force_persist().await?;
    assert!(backend.peek("record:c").is_some());
    assert_eq!(store.save_many_immediate(Vec::new()).await?, Vec::<usize>::new());
    Ok(())
}

#[tokio::test]
async fn bursts_of_saves_are_coalesced() -> Result<(), Box<dyn std::error::Error>> {
    let backend = Arc::new(MemoryStore::new());
    let config = StoreConfig::builder().debounce(Duration::from_millis(50)).build()?;
    let store = RecordStore::open(backend.clone(), config);

    for round in 0..10 {
        for id in 0..10 {
            store.save_one(record(&format!("r{id}"), round as f64)).await?;
        }
    }
    assert_eq!(backend.total_writes(), 0);
    assert_eq!(store.pending_writes(), 10);

    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(backend.total_writes(), 10);
    for id in 0..10 {
        let key = format!("record:r{id}");
        assert_eq!(backend.write_count(&key), 1);
        assert_eq!(backend.peek(&key).unwrap()["monthlyCost"], json!(9.0));
    }
    assert_eq!(store.pending_writes(), 0);
    Ok(())
}

#[tokio::test]
async fn concurrent_flush_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let backend = Arc::new(MemoryStore::new().with_write_delay(Duration::from_millis(100)));
    let store = RecordStore::open(backend.clone(), quiet_config());
    store.save_one(record("a", 1.0)).await?;

    let (first, second) = tokio::join!(store.flush(), store.flush());
    assert_eq!(first?.written, 1);
    assert!(matches!(second, Err(ref err) if err.is_guard()));

    // With nothing pending a flush is a no-op.
    assert_eq!(store.flush().await?, FlushReport::default());
    Ok(())
}

#[tokio::test]
async fn saves_during_a_flush_get_another_round() -> Result<(), Box<dyn std::error::Error>> {
    let backend = Arc::new(MemoryStore::new().with_write_delay(Duration::from_millis(100)));
    let store = RecordStore::open(backend.clone(), quiet_config());
    store.save_one(record("a", 1.0)).await?;

    let late = async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        store.save_one(record("b", 2.0)).await
    };
    let (report, late) = tokio::join!(store.force_persist(), late);
    late?;
    let report = report?;
    assert_eq!(report.rounds, 2);
    assert_eq!(report.written, 3);
    assert!(backend.peek("record:b").is_some());
    assert_eq!(store.pending_writes(), 0);
    Ok(())
}

#[tokio::test]
async fn flush_rounds_are_bounded() -> Result<(), Box<dyn std::error::Error>> {
    let backend = Arc::new(MemoryStore::new().with_write_delay(Duration::from_millis(100)));
    let config = StoreConfig::builder()
        .max_flush_rounds(1)
        .debounce(Duration::from_secs(10))
        .build()?;
    let store = RecordStore::open(backend.clone(), config);
    store.save_one(record("a", 1.0)).await?;

    let late = async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        store.save_one(record("b", 2.0)).await
    };
    let (report, late) = tokio::join!(store.force_persist(), late);
    late?;
    assert_eq!(report?.rounds, 1);
    assert!(backend.peek("record:b").is_none());
    assert_eq!(store.pending_writes(), 1);

    backend.set_write_delay(Duration::ZERO);
    assert_eq!(store.close().await?.written, 2);
    assert!(backend.peek("record:b").is_some());
    Ok(())
}

#[tokio::test]
async fn immediate_saves_during_a_flush_are_not_overwritten() -> Result<(), Box<dyn std::error::Error>> {
    let backend = Arc::new(MemoryStore::new().with_write_delay(Duration::from_millis(200)));
    let store = RecordStore::open(backend.clone(), quiet_config());
    store.save_one(record("a", 1.0)).await?;

    let replace = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        backend.set_write_delay(Duration::ZERO);
        store.save_many_immediate(vec![record("a", 5.0)]).await
    };
    let (flushed, saved) = tokio::join!(store.flush(), replace);
    assert_eq!(flushed?.written, 1);
    assert_eq!(saved?, vec![1]);

    assert_eq!(backend.peek("record:a").unwrap()["monthlyCost"], json!(5.0));
    assert_eq!(store.pending_writes(), 0);
    Ok(())
}

#[tokio::test]
async fn deletes_reach_the_backend() -> Result<(), Box<dyn std::error::Error>> {
    let backend = Arc::new(MemoryStore::new());
    let store = RecordStore::open(backend.clone(), quiet_config());
    store.save_one(record("a", 1.0)).await?;
    store.save_one(record("b", 2.0)).await?;
    store.force_persist().await?;
    assert_eq!(backend.len(), 2);

    assert!(store.delete("a").await?);
    assert!(!store.delete("a").await?);
    assert!(!store.delete("missing").await?);

    let report = store.force_persist().await?;
    assert_eq!(report.deleted, 1);
    assert!(backend.peek("record:a").is_none());
    assert!(store.find_by_id("a").await?.is_none());
    assert_eq!(store.len().await?, 1);
    Ok(())
}

#[tokio::test]
async fn corrupted_backend_is_wiped_on_load() -> Result<(), Box<dyn std::error::Error>> {
    let backend = Arc::new(MemoryStore::new());
    backend.insert_raw("record:a", record("a", 1.0).to_attributes()?);
    backend.set_corrupted(true);

    let store = RecordStore::open(backend.clone(), quiet_config());
    assert!(store.find_all().await?.is_empty());
    assert!(backend.is_empty());

    // The store stays usable.
    store.save_one(record("b", 1.0)).await?;
    store.force_persist().await?;
    assert!(backend.peek("record:b").is_some());
    Ok(())
}

#[tokio::test]
async fn corruption_is_reported_when_wiping_is_disabled() -> Result<(), Box<dyn std::error::Error>> {
    let backend = Arc::new(MemoryStore::new());
    backend.insert_raw("record:a", record("a", 1.0).to_attributes()?);
    backend.set_corrupted(true);

    let config = StoreConfig::builder().clear_on_corruption(false).build()?;
    let store = RecordStore::open(backend.clone(), config);
    assert!(matches!(
        store.find_all().await,
        Err(StoreError::Backend(BackendError::Corrupted(_)))
    ));
    assert_eq!(backend.len(), 1);
    Ok(())
}

#[tokio::test]
async fn failed_load_can_be_retried() -> Result<(), Box<dyn std::error::Error>> {
    let backend = Arc::new(MemoryStore::new());
    backend.insert_raw("record:a", record("a", 1.0).to_attributes()?);
    backend.set_unavailable(true);

    let store = RecordStore::open(backend.clone(), quiet_config());
    assert!(store.find_all().await.is_err());

    backend.heal();
    assert_eq!(store.find_all().await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn unreadable_entries_are_skipped_on_load() -> Result<(), Box<dyn std::error::Error>> {
    let backend = Arc::new(MemoryStore::new());
    backend.insert_raw("record:good", record("good", 1.0).to_attributes()?);
    backend.insert_raw("record:garbage", json!({"id": "garbage"}));
    backend.insert_raw("record:elsewhere", record("moved", 1.0).to_attributes()?);
    backend.insert_raw("settings:theme", json!("dark"));

    let store = RecordStore::open(backend.clone(), quiet_config());
    let all = store.find_all().await?;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id(), "good");
    Ok(())
}

#[tokio::test]
async fn load_keeps_newer_cached_records() -> Result<(), Box<dyn std::error::Error>> {
    let backend = Arc::new(MemoryStore::new());
    backend.insert_raw("record:a", record("a", 1.0).to_attributes()?);
    backend.insert_raw("record:b", record("b", 2.0).to_attributes()?);

    let store = RecordStore::open(backend.clone(), quiet_config());
    store.save_one(record("a", 10.0)).await?;

    assert_eq!(store.ensure_loaded().await?, 1);
    assert_eq!(store.find_by_id("a").await?.unwrap().monthly_cost(), 10.0);
    assert_eq!(store.find_by_id("b").await?.unwrap().monthly_cost(), 2.0);
    assert_eq!(store.ensure_loaded().await?, 0);
    Ok(())
}

#[tokio::test]
async fn persist_over_budget_times_out() -> Result<(), Box<dyn std::error::Error>> {
    let backend = Arc::new(MemoryStore::new().with_write_delay(Duration::from_millis(500)));
    let config = StoreConfig::builder()
        .persist_timeout(Duration::from_millis(20))
        .debounce(Duration::from_secs(10))
        .build()?;
    let store = RecordStore::open(backend.clone(), config);
    store.save_one(record("a", 1.0)).await?;

    let outcome = store.force_persist().await;
    assert!(matches!(outcome, Err(ref err) if err.is_timeout()));
    assert_eq!(store.pending_writes(), 1);

    backend.set_write_delay(Duration::ZERO);
    assert_eq!(store.force_persist().await?.written, 1);
    assert!(backend.peek("record:a").is_some());
    Ok(())
}

#[tokio::test]
async fn timed_out_persist_is_retried_by_the_debounce() -> Result<(), Box<dyn std::error::Error>> {
    let backend = Arc::new(MemoryStore::new().with_write_delay(Duration::from_millis(500)));
    let config = StoreConfig::builder()
        .persist_timeout(Duration::from_millis(20))
        .debounce(Duration::from_millis(50))
        .build()?;
    let store = RecordStore::open(backend.clone(), config);
    store.save_one(record("a", 1.0)).await?;

    assert!(matches!(store.force_persist().await, Err(ref err) if err.is_timeout()));
    backend.set_write_delay(Duration::ZERO);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(backend.peek("record:a").is_some());
    assert_eq!(store.pending_writes(), 0);
    Ok(())
}

#[tokio::test]
async fn flush_fails_when_backend_is_down() -> Result<(), Box<dyn std::error::Error>> {
    let backend = Arc::new(MemoryStore::new());
    let store = RecordStore::open(backend.clone(), quiet_config());
    store.save_one(record("a", 1.0)).await?;

    backend.set_unavailable(true);
    assert!(matches!(
        store.force_persist().await,
        Err(StoreError::Backend(BackendError::Unavailable(_)))
    ));
    assert_eq!(store.pending_writes(), 1);

    backend.heal();
    assert_eq!(store.close().await?.written, 1);
    Ok(())
}

#[tokio::test]
async fn lookups() -> Result<(), Box<dyn std::error::Error>> {
    let backend = Arc::new(MemoryStore::new());
    let store = RecordStore::open(backend.clone(), quiet_config());

    store.save_one(record("i-1", 1.0)).await?;
    let mut azure = RecordDraft::new("vm-1", SourceSystem::Azure);
    azure.region = "westeurope".into();
    store.save_one(azure.build()?).await?;

    let found = store.find_by_dedupe_key(" I-1 ", "ec2", "US-EAST-1").await?;
    assert_eq!(found.map(|r| r.id().to_string()), Some("i-1".to_string()));
    assert!(store.find_by_dedupe_key("i-1", "EC2", "eu-west-1").await?.is_none());
    assert!(store.find_by_dedupe_key("  ", "EC2", "us-east-1").await?.is_none());

    let azure = store.find_by_source_system(SourceSystem::Azure).await?;
    assert_eq!(azure.len(), 1);
    assert_eq!(azure[0].id(), "vm-1");
    assert_eq!(store.len().await?, 2);
    assert!(!store.is_empty().await?);
    Ok(())
}

#[tokio::test]
async fn clear_wipes_cache_and_backend() -> Result<(), Box<dyn std::error::Error>> {
    let backend = Arc::new(MemoryStore::new());
    let store = RecordStore::open(backend.clone(), quiet_config());
    store.save_one(record("a", 1.0)).await?;
    store.force_persist().await?;
    store.save_one(record("b", 1.0)).await?;

    store.clear().await?;
    assert!(backend.is_empty());
    assert!(store.is_empty().await?);
    assert_eq!(store.pending_writes(), 0);
    assert_eq!(store.force_persist().await?, FlushReport::default());
    Ok(())
}

#[tokio::test]
async fn failed_clear_keeps_the_cache() -> Result<(), Box<dyn std::error::Error>> {
    let backend = Arc::new(MemoryStore::new());
    backend.insert_raw("record:a", record("a", 1.0).to_attributes()?);
    let store = RecordStore::open(backend.clone(), quiet_config());
    assert_eq!(store.len().await?, 1);
    store.save_one(record("b", 2.0)).await?;

    backend.set_unavailable(true);
    assert!(store.clear().await.is_err());
    backend.heal();

    assert_eq!(store.len().await?, 2);
    assert!(store.find_by_id("a").await?.is_some());
    assert_eq!(store.pending_writes(), 1);
    assert_eq!(backend.len(), 1);

    store.clear().await?;
    assert!(store.is_empty().await?);
    assert!(backend.is_empty());
    Ok(())
}
