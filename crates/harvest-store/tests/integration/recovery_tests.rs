use std::time::Duration;

use chrono::{NaiveDate, Utc};
use harvest_core::crawl::{CrawlRequest, crawl};
use harvest_core::models::{
    Checkpoint, EXIT_OK, EXIT_RECOVERED, NormalizedRecord, PageCursor, Run, SourceKind,
    ValidatedRecord,
};
use harvest_core::quality::dedup_key;
use harvest_core::scheduler::{Scheduler, SchedulerConfig};
use harvest_core::traits::{CheckpointStore, PartitionWriter, ScheduleStateStore};
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::integration::common::{
    AGENDA_PAGE_1, AGENDA_PAGE_2, GIG_RULES, TestSite, pipeline, write_registry,
};

fn execution_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 7, 1).unwrap()
}

#[tokio::test]
async fn recover_merges_orphaned_silver_and_seals() {
    let data = TempDir::new().unwrap();
    let pipeline = pipeline(data.path());
    let store = pipeline.store();

    // A run that appended silver and then died before sealing.
    let run = Run::open(Some(execution_date()));
    store.open_run(&run).await.unwrap();
    let record = NormalizedRecord {
        source_id: "lyon_gigs".into(),
        kind: SourceKind::Events,
        url: "https://lyon.example/agenda".into(),
        fields: json!({
            "title": "Jazz Night",
            "start": "2026-07-10T20:00:00+02:00",
            "city": "Lyon",
            "country": "FR"
        })
        .as_object()
        .cloned()
        .unwrap(),
    };
    store
        .append_silver(
            &run,
            SourceKind::Events,
            &[ValidatedRecord {
                key: dedup_key(&record),
                job_id: Uuid::new_v4(),
                run_id: run.run_id.clone(),
                observed_at: Utc::now(),
                record,
            }],
        )
        .await
        .unwrap();

    let recovered = pipeline.recover().await.unwrap();

    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].run_id, run.run_id);
    assert_eq!(recovered[0].exit_code, EXIT_RECOVERED);
    assert_eq!(recovered[0].partitions_touched[0].inserted, 1);
    assert!(store.unsealed_runs().await.unwrap().is_empty());

    let gold = store
        .read_gold(execution_date(), SourceKind::Events)
        .await
        .unwrap();
    assert_eq!(gold.len(), 1);
    assert!(gold[0].run_ids.contains(&run.run_id));

    // Nothing left to recover on the next start.
    assert!(pipeline.recover().await.unwrap().is_empty());
}

#[tokio::test]
async fn crawl_resumes_from_saved_checkpoint() {
    let site = TestSite::start().await;
    site.page("/agenda", AGENDA_PAGE_1);
    site.page("/agenda?page=2", AGENDA_PAGE_2);

    let config_dir = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    let registry = write_registry(
        config_dir.path(),
        "lyon_gigs",
        &format!("{}/agenda", site.base),
        GIG_RULES,
    );
    let pipeline = pipeline(data.path());

    // Progress left behind by an interrupted job that finished page 1.
    pipeline
        .store()
        .save_checkpoint(&Checkpoint {
            source_id: "lyon_gigs".into(),
            run_id: "earlier".into(),
            job_id: Uuid::new_v4(),
            cursor: PageCursor {
                page_index: 1,
                url: format!("{}/agenda?page=2", site.base),
            },
            pages_fetched: 1,
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

    let request = CrawlRequest {
        execution_date: Some(execution_date()),
        ..Default::default()
    };
    let outcome = crawl(&pipeline, &registry, &request, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.exit_code(), EXIT_OK);
    assert!(site.hits("/agenda").is_empty());
    assert_eq!(site.hits("/agenda?page=2"), vec![200]);
    assert!(
        pipeline
            .store()
            .load_checkpoint("lyon_gigs")
            .await
            .unwrap()
            .is_none()
    );

    let gold = pipeline
        .store()
        .read_gold(execution_date(), SourceKind::Events)
        .await
        .unwrap();
    assert_eq!(gold.len(), 1);
    assert_eq!(gold[0].fields["title"], "Folk Evening");
}

#[tokio::test]
async fn scheduler_tick_persists_last_success() {
    let site = TestSite::start().await;
    site.page("/agenda", AGENDA_PAGE_2);

    let config_dir = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    let registry = write_registry(
        config_dir.path(),
        "lyon_gigs",
        &format!("{}/agenda", site.base),
        GIG_RULES,
    );
    let pipeline = pipeline(data.path());
    let store = pipeline.store().clone();

    let scheduler = Scheduler::new(
        pipeline,
        registry,
        SchedulerConfig::default()
            .with_tick_interval(Duration::from_millis(10))
            .with_max_ticks(1),
    );
    let report = scheduler.run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.ticks, 1);
    assert_eq!(report.manifests.len(), 1);
    assert_eq!(report.exit_code(), EXIT_OK);

    let schedule = store.load_schedule().await.unwrap();
    assert!(schedule.contains_key("lyon_gigs"));
    assert!(store.layout().schedule().exists());
}
