mod common;

use axum::http::StatusCode;
use serde_json::Value;

use std::sync::Arc;

use birdnet_runner::{JobOutcome, Stage};
use common::{
    BrokenUploads, FIXTURE_KEY, FIXTURE_MD5, FailingFactory, Harness, PROCESSOR_ID, job_json,
};

const RESULTS_KEY: &str = "PROJECT_SLUG/GROUP/soundscape.wav_data.json";

#[tokio::test]
async fn test_fixture_run_end_to_end() {
    let harness = Harness::new().await;
    harness.state.push_job(&job_json(3228, 2, FIXTURE_KEY));
    let pipeline = harness.pipeline();

    let report = match pipeline.run_once().await {
        JobOutcome::Completed(report) => report,
        other => panic!("expected completion, got {:?}", other),
    };

    assert_eq!(report.job_id, 3228);
    assert_eq!(report.detections, 3);
    assert_eq!(report.extracted.clips, 1);
    assert_eq!(report.extracted.spectrograms, 1);
    assert_eq!(report.skipped_uploads, 0);
    assert!(!report.is_degraded());
    assert_eq!(report.files_removed, 3);
    assert_eq!(report.results_url, format!("https://data.s3.amazonaws.com/{}", RESULTS_KEY));

    // Nothing left on local disk
    assert!(harness.scratch_files().is_empty(), "left behind: {:?}", harness.scratch_files());

    // Identity travelled with the dequeue request
    assert_eq!(harness.state.api_keys.lock().unwrap()[0], common::API_KEY);
    assert_eq!(harness.state.dequeue_forms.lock().unwrap()[0]["server_id"], PROCESSOR_ID);

    let reports = harness.state.reports.lock().unwrap().clone();
    assert_eq!(reports.len(), 1);
    let (id, payload) = &reports[0];
    assert_eq!(*id, 3228);
    assert_eq!(payload["file_checksum"], FIXTURE_MD5);
    assert_eq!(payload["config_id"], 2);
    assert_eq!(payload["duration_seconds"], 9.0);
    assert_eq!(payload["analyzer_instance_id"], PROCESSOR_ID);
    assert_eq!(payload["analyzer_instance_type"], "c5.xlarge");
    assert_eq!(payload["analyzer_version"], "scripted-1");
    assert!(payload["analyzer_duration_seconds"].as_f64().unwrap() >= 0.0);

    let detections = payload["detections"].as_array().unwrap();
    assert_eq!(detections.len(), 3);
    assert!(detections[0].get("extracted_audio_url").is_none());
    assert_eq!(
        detections[1]["extracted_audio_url"],
        "https://extraction.s3.amazonaws.com/PROJECT_SLUG/GROUP/soundscape_3.0s-6.0s.wav"
    );
    assert_eq!(
        detections[1]["extracted_spectrogram_url"],
        "https://extraction.s3.amazonaws.com/PROJECT_SLUG/GROUP/soundscape_3.0s-6.0s.png"
    );
    assert_eq!(detections[2]["extracted_audio_url"], detections[1]["extracted_audio_url"]);
    assert!(detections[2].get("extracted_spectrogram_url").is_none());

    // Artifacts and results document are in storage
    for ext in ["wav", "png"] {
        let key = format!("PROJECT_SLUG/GROUP/soundscape_3.0s-6.0s.{}", ext);
        assert!(harness.object("extraction", &key).await.is_some(), "missing {}", key);
    }

    let document = harness.object("data", RESULTS_KEY).await.unwrap();
    let document: Value = serde_json::from_slice(&document).unwrap();
    assert_eq!(document["file_checksum"], FIXTURE_MD5);
    assert_eq!(document["analyzer_config"]["id"], 2);
    assert_eq!(document["analyzer_config"]["analyzer"]["name"], "BirdNET-Analyzer");
}

#[tokio::test]
async fn test_fixture_results_are_deterministic() {
    let harness = Harness::new().await;
    harness.state.push_job(&job_json(1, 2, FIXTURE_KEY));
    harness.state.push_job(&job_json(2, 2, FIXTURE_KEY));
    let pipeline = harness.pipeline();

    let mut summaries = Vec::new();
    for _ in 0..2 {
        match pipeline.run_once().await {
            JobOutcome::Completed(report) => summaries.push((report.detections, report.extracted)),
            other => panic!("expected completion, got {:?}", other),
        }
    }
    assert_eq!(summaries[0], summaries[1]);

    let reports = harness.state.reports.lock().unwrap().clone();
    assert_eq!(reports[0].1["file_checksum"], reports[1].1["file_checksum"]);
}

#[tokio::test]
async fn test_missing_source_aborts_without_report() {
    let harness = Harness::new().await;
    harness.state.push_job(&job_json(77, 2, "PROJECT_SLUG/GROUP/missing.wav"));
    let pipeline = harness.pipeline();

    match pipeline.run_once().await {
        JobOutcome::Faulted(fault) => {
            assert_eq!(fault.job_id, Some(77));
            assert_eq!(fault.stage, Stage::Stage);
            assert_eq!(fault.error.kind(), "transfer");
        }
        other => panic!("expected a fault, got {:?}", other),
    }

    assert_eq!(harness.state.report_count(), 0);
    assert!(harness.scratch_files().is_empty());
    assert_eq!(harness.factory.build_count(), 0);
}

#[tokio::test]
async fn test_dequeue_error_status() {
    let harness = Harness::new().await;
    harness.state.push_dequeue(StatusCode::NOT_FOUND, "");
    let pipeline = harness.pipeline();

    match pipeline.run_once().await {
        JobOutcome::Faulted(fault) => {
            assert_eq!(fault.job_id, None);
            assert_eq!(fault.stage, Stage::Dequeue);
            assert_eq!(fault.error.status(), Some(404));
            assert_eq!(
                fault.error.to_string(),
                "Remote could not connect to API endpoint (status 404)."
            );
        }
        other => panic!("expected a fault, got {:?}", other),
    }
    assert_eq!(harness.state.report_count(), 0);
}

#[tokio::test]
async fn test_empty_queue_is_idle() {
    let harness = Harness::new().await;
    let pipeline = harness.pipeline();

    assert!(matches!(pipeline.run_once().await, JobOutcome::Idle));
    harness.state.push_dequeue(StatusCode::OK, r#"{"safe_to_shutdown": true}"#);
    assert!(matches!(pipeline.run_once().await, JobOutcome::SafeToShutdown));
    assert_eq!(harness.factory.build_count(), 0);
}

#[tokio::test]
async fn test_cache_reuses_analyzer_across_jobs() {
    let harness = Harness::new().await;
    harness.state.push_job(&job_json(1, 2, FIXTURE_KEY));
    harness.state.push_job(&job_json(2, 3, FIXTURE_KEY));
    harness.state.push_job(&job_json(3, 2, FIXTURE_KEY));
    let pipeline = harness.pipeline();

    for _ in 0..3 {
        assert!(matches!(pipeline.run_once().await, JobOutcome::Completed(_)));
    }

    assert_eq!(harness.factory.build_count(), 2);
    assert_eq!(pipeline.cache().init_count(), 2);
    assert_eq!(pipeline.cache().len().await, 2);
    assert_eq!(harness.state.report_count(), 3);
}

#[tokio::test]
async fn test_report_rejection_still_cleans_up() {
    let harness = Harness::new().await;
    *harness.state.report_status.lock().unwrap() = StatusCode::INTERNAL_SERVER_ERROR;
    harness.state.push_job(&job_json(5, 2, FIXTURE_KEY));
    let pipeline = harness.pipeline();

    match pipeline.run_once().await {
        JobOutcome::Faulted(fault) => {
            assert_eq!(fault.stage, Stage::Report);
            assert_eq!(fault.error.status(), Some(500));
        }
        other => panic!("expected a fault, got {:?}", other),
    }
    assert!(harness.scratch_files().is_empty());
}

#[tokio::test]
async fn test_missing_extraction_bucket_degrades() {
    let harness = Harness::new().await;
    let mut job = job_json(6, 2, FIXTURE_KEY);
    job["project"]["analyzer_config"]
        .as_object_mut()
        .unwrap()
        .remove("extraction_spectrogram_file_destination");
    harness.state.push_job(&job);
    let pipeline = harness.pipeline();

    let report = match pipeline.run_once().await {
        JobOutcome::Completed(report) => report,
        other => panic!("expected completion, got {:?}", other),
    };
    assert!(report.is_degraded());
    assert_eq!(report.skipped_uploads, 1);
    assert!(harness.scratch_files().is_empty());

    let reports = harness.state.reports.lock().unwrap().clone();
    let detections = reports[0].1["detections"].as_array().unwrap().clone();
    assert!(detections[1].get("extracted_audio_url").is_some());
    assert!(detections[1].get("extracted_spectrogram_url").is_none());
}

#[tokio::test]
async fn test_missing_results_bucket_faults_after_cleanup() {
    let harness = Harness::new().await;
    let mut job = job_json(8, 2, FIXTURE_KEY);
    job["project"]["analyzer_config"]
        .as_object_mut()
        .unwrap()
        .remove("analysis_json_file_destination");
    harness.state.push_job(&job);
    let pipeline = harness.pipeline();

    match pipeline.run_once().await {
        JobOutcome::Faulted(fault) => {
            assert_eq!(fault.stage, Stage::Upload);
            assert_eq!(fault.error.kind(), "config");
        }
        other => panic!("expected a fault, got {:?}", other),
    }
    assert_eq!(harness.state.report_count(), 0);
    assert!(harness.scratch_files().is_empty());
}

#[tokio::test]
async fn test_failed_artifact_uploads_degrade_job() {
    let harness = Harness::new().await;
    harness.state.push_job(&job_json(9, 2, FIXTURE_KEY));
    let storage = Arc::new(BrokenUploads {
        inner: harness.stores.clone(),
        broken_bucket: "extraction".to_string(),
    });
    let pipeline = harness.pipeline_with(storage, harness.factory.clone());

    let report = match pipeline.run_once().await {
        JobOutcome::Completed(report) => report,
        other => panic!("expected completion, got {:?}", other),
    };
    assert!(report.is_degraded());
    assert_eq!(report.uploaded, 0);
    assert_eq!(report.skipped_uploads, 3);
    assert_eq!(report.files_removed, 3);
    assert!(harness.scratch_files().is_empty(), "left behind: {:?}", harness.scratch_files());

    let reports = harness.state.reports.lock().unwrap().clone();
    assert_eq!(reports.len(), 1);
    for detection in reports[0].1["detections"].as_array().unwrap() {
        assert!(detection.get("extracted_audio_url").is_none());
        assert!(detection.get("extracted_spectrogram_url").is_none());
    }
    assert!(harness.object("data", RESULTS_KEY).await.is_some());
}

#[tokio::test]
async fn test_classification_failure_releases_staged_file() {
    let harness = Harness::new().await;
    harness.state.push_job(&job_json(12, 2, FIXTURE_KEY));
    let pipeline = harness.pipeline_with(harness.stores.clone(), Arc::new(FailingFactory));

    match pipeline.run_once().await {
        JobOutcome::Faulted(fault) => {
            assert_eq!(fault.job_id, Some(12));
            assert_eq!(fault.stage, Stage::Analyze);
            assert_eq!(fault.error.kind(), "classification");
        }
        other => panic!("expected a fault, got {:?}", other),
    }
    assert_eq!(harness.state.report_count(), 0);
    assert!(harness.scratch_files().is_empty(), "left behind: {:?}", harness.scratch_files());
    assert!(harness.object("data", RESULTS_KEY).await.is_none());
}
