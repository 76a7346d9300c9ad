//! Integration tests for TaskStore over the bundled backends.

use std::sync::Arc;

use armada_tasks::counter::{CounterBody, CounterSubStage};
use armada_tasks::domain::{TaskRecord, TaskRequest};
use armada_tasks::store::file::FileBackend;
use armada_tasks::store::memory::InMemoryBackend;
use armada_tasks::store::{StoreConfig, TaskStore};
use armada_tasks::{TaskAddress, TaskError, TaskStage, CONTEXT_ID_KEY};

type CounterRecord = TaskRecord<CounterSubStage, CounterBody>;

fn counter(id: &str, expecting: u64) -> CounterRecord {
    TaskRecord::new(
        TaskAddress::new("counter", id),
        TaskRequest::new(CounterBody::expecting(expecting)),
    )
}

// ─── Concurrency ────────────────────────────────────────────────────────────

mod concurrency_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_modify_loses_no_writes() {
        let store = TaskStore::new(InMemoryBackend::new()).with_config(StoreConfig {
            max_cas_retries: 1_000,
            ..StoreConfig::default()
        });
        let mut record = counter("race", 64);
        store.create(&mut record).await.unwrap();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..64)
            .map(|i| {
                let store = Arc::clone(&store);
                let address = record.address.clone();
                tokio::spawn(async move {
                    store
                        .modify(&address, |r: &mut CounterRecord| {
                            r.body.handled.insert(format!("child:{i}"));
                            r.body.completions_remaining =
                                r.body.completions_remaining.map(|n| n - 1);
                            Ok(true)
                        })
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stored: CounterRecord = store.get(&record.address).await.unwrap();
        assert_eq!(stored.body.handled.len(), 64);
        assert_eq!(stored.body.completions_remaining, Some(0));
        assert_eq!(stored.version, 65);
    }
}

// ─── File Backend ───────────────────────────────────────────────────────────

mod file_store_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_typed_record_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let address = {
            let store = TaskStore::new(FileBackend::open(dir.path()).await.unwrap());
            let mut record = counter("durable", 2);
            record
                .custom_properties
                .insert(CONTEXT_ID_KEY.to_string(), "ctx-7".to_string());
            store.create(&mut record).await.unwrap();
            store
                .modify(&record.address, |r: &mut CounterRecord| {
                    r.stage = TaskStage::Started;
                    r.sub_stage = CounterSubStage::Counting;
                    r.body.handled.insert("child:1".to_string());
                    Ok(true)
                })
                .await
                .unwrap();
            record.address
        };

        let store = TaskStore::new(FileBackend::open(dir.path()).await.unwrap());
        let record: CounterRecord = store.get(&address).await.unwrap();
        assert_eq!(record.sub_stage, CounterSubStage::Counting);
        assert_eq!(record.body.handled.len(), 1);
        assert_eq!(record.version, 2);

        let correlated = store.find_by_correlation("ctx-7").await.unwrap();
        assert_eq!(correlated.len(), 1);
        assert_eq!(correlated[0].address, address);
    }

    #[tokio::test]
    async fn test_unknown_sub_stage_name_is_a_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(FileBackend::open(dir.path()).await.unwrap());
        let mut record = counter("typed", 1);
        store.create(&mut record).await.unwrap();

        store
            .modify(&record.address, |r: &mut CounterRecord| {
                r.sub_stage = CounterSubStage::Counting;
                Ok(true)
            })
            .await
            .unwrap();
        let wrong: Result<TaskRecord<armada_tasks::DefaultSubStage, CounterBody>, TaskError> =
            store.get(&record.address).await;
        assert!(matches!(wrong, Err(TaskError::StoreError(_))));
    }
}
