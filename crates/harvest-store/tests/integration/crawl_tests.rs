use chrono::NaiveDate;
use harvest_core::crawl::{CrawlOutcome, CrawlRequest, crawl};
use harvest_core::models::SourceKind;
use harvest_core::traits::{CheckpointStore, PartitionWriter, QuarantineSink};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::integration::common::{
    AGENDA_PAGE_1, AGENDA_PAGE_2, GIG_RULES, TestSite, pipeline, write_registry,
};

fn execution_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 7, 1).unwrap()
}

fn request() -> CrawlRequest {
    CrawlRequest {
        execution_date: Some(execution_date()),
        ..Default::default()
    }
}

#[tokio::test]
async fn crawl_writes_every_layer() {
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

    let outcome = crawl(&pipeline, &registry, &request(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.exit_code(), 0);
    let CrawlOutcome::Finished { manifest, jobs, .. } = outcome else {
        panic!("crawl should run");
    };
    assert_eq!(jobs.len(), 1);
    assert_eq!(manifest.jobs[0].pages_fetched, 2);

    // Gold holds every valid listing from both pages.
    let store = pipeline.store();
    let gold = store
        .read_gold(execution_date(), SourceKind::Events)
        .await
        .unwrap();
    let mut titles: Vec<&str> = gold
        .iter()
        .filter_map(|r| r.fields.get("title").and_then(|v| v.as_str()))
        .collect();
    titles.sort();
    assert_eq!(titles, vec!["Brass Band", "Folk Evening", "Jazz Night"]);

    let brass = gold
        .iter()
        .find(|r| r.fields["title"] == "Brass Band")
        .unwrap();
    assert_eq!(brass.fields["start"], "2026-07-11T19:30:00+02:00");
    assert_eq!(brass.fields["country"], "FR");

    // The listing without a country is quarantined, not lost.
    let quarantined = store.list_quarantined().await.unwrap();
    assert_eq!(quarantined.len(), 1);
    assert!(
        quarantined[0]
            .reason_codes
            .contains(&"missing_required_field:country".to_string())
    );

    let layout = store.layout();
    assert!(layout.gold_csv(execution_date(), SourceKind::Events).exists());
    assert!(layout.manifest(&manifest.run_id).exists());
    assert!(layout.metrics(&manifest.run_id).exists());
    assert!(store.list_checkpoints().await.unwrap().is_empty());
    assert!(store.unsealed_runs().await.unwrap().is_empty());

    let metrics = store.read_metrics(&manifest.run_id).await.unwrap().unwrap();
    assert_eq!(metrics.fetched, 2);
    assert_eq!(metrics.quarantined, 1);
}

#[tokio::test]
async fn second_crawl_revalidates_and_keeps_gold() {
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

    crawl(&pipeline, &registry, &request(), CancellationToken::new())
        .await
        .unwrap();
    let gold_before = pipeline
        .store()
        .read_gold(execution_date(), SourceKind::Events)
        .await
        .unwrap();

    let outcome = crawl(&pipeline, &registry, &request(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.exit_code(), 0);

    // Both pages answered 304 the second time, and pagination still reached page 2.
    assert_eq!(site.hits("/agenda"), vec![200, 304]);
    assert_eq!(site.hits("/agenda?page=2"), vec![200, 304]);

    let CrawlOutcome::Finished { manifest, .. } = outcome else {
        panic!("crawl should run");
    };
    let metrics = pipeline
        .store()
        .read_metrics(&manifest.run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(metrics.cache_skipped, 2);
    assert_eq!(metrics.extracted, 0);

    let gold_after = pipeline
        .store()
        .read_gold(execution_date(), SourceKind::Events)
        .await
        .unwrap();
    assert_eq!(gold_before, gold_after);
    assert_eq!(pipeline.store().list_manifests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn dry_run_touches_nothing() {
    let site = TestSite::start().await;
    site.page("/agenda", AGENDA_PAGE_1);

    let config_dir = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    let registry = write_registry(
        config_dir.path(),
        "lyon_gigs",
        &format!("{}/agenda", site.base),
        GIG_RULES,
    );
    let request = CrawlRequest {
        dry_run: true,
        ..request()
    };

    let outcome = crawl(
        &pipeline(data.path()),
        &registry,
        &request,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let CrawlOutcome::Planned(jobs) = outcome else {
        panic!("dry run should only plan");
    };
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].url, format!("{}/agenda", site.base));
    assert!(site.hits("/agenda").is_empty());
    assert!(std::fs::read_dir(data.path()).unwrap().next().is_none());
}
