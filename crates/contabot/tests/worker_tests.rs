//! Worker loop against in-process gateways.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{FailingExtraction, FailingStorage, FixedExtraction, Harness, MemoryStorage, BOUND_CHAT};
use contabot::db::invoice_repo::{self, InvoiceFilter};
use contabot::db::{credential_repo, job_repo};
use contabot::invoice::{InvoiceFields, NewInvoice, LOW_CONFIDENCE_MARKER};
use contabot::messages;
use contabot::{JobStatus, ReviewState};

#[tokio::test]
async fn test_processes_job_into_pending_invoice() {
    let h = Harness::new();
    let storage = Arc::new(MemoryStorage::default());
    let worker = h.worker(Arc::new(FixedExtraction::with_confidence(96.5)), storage.clone());
    let job_id = h.enqueue("photo-a");

    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.completed, 1);

    let job = job_repo::find_by_id(&h.db, job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 0);
    assert!(job.completed_at.is_some());

    let invoice = invoice_repo::find_by_job_id(&h.db, job_id).unwrap().unwrap();
    assert_eq!(invoice.review_state, ReviewState::Pending);
    assert_eq!(invoice.tenant_id, h.tenant_id);
    assert_eq!(invoice.confidence_score, 96.5);
    assert_eq!(
        invoice.fields.vendor_name.as_deref(),
        Some("Supermercado Nacional")
    );
    assert!(invoice.notes.is_none());

    let uploads = storage.uploads.lock().unwrap().clone();
    assert_eq!(uploads.len(), 1);
    assert!(uploads[0].starts_with(&format!("factura_{}_", job_id)));
    assert!(uploads[0].ends_with(".jpg"));
    assert_eq!(invoice.storage_url, format!("https://files.example/{}", uploads[0]));

    let texts = h.messenger.texts_to(BOUND_CHAT);
    assert_eq!(texts.len(), 1);
    assert!(texts[0].contains(&format!("Factura #{}", invoice.id)));
}

#[tokio::test]
async fn test_extraction_failure_still_completes_job() {
    let h = Harness::new();
    let worker = h.worker(Arc::new(FailingExtraction), Arc::new(MemoryStorage::default()));
    let job_id = h.enqueue("photo-b");

    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.completed, 1);

    let job = job_repo::find_by_id(&h.db, job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    let invoice = invoice_repo::find_by_job_id(&h.db, job_id).unwrap().unwrap();
    assert_eq!(invoice.confidence_score, 0.0);
    assert_eq!(invoice.fields, InvoiceFields::default());
    assert!(invoice
        .notes
        .as_deref()
        .is_some_and(|n| n.contains(LOW_CONFIDENCE_MARKER)));
}

#[tokio::test]
async fn test_upload_failure_exhausts_attempts() {
    let h = Harness::new();
    let storage = Arc::new(FailingStorage::default());
    let worker = h.worker(Arc::new(FixedExtraction::with_confidence(90.0)), storage.clone());
    let job_id = h.enqueue("photo-c");

    for expected_attempts in 1..=2 {
        let report = worker.run_cycle().await.unwrap();
        assert_eq!(report.retried, 1);
        let job = job_repo::find_by_id(&h.db, job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, expected_attempts);
        assert!(job.last_error.as_deref().unwrap().contains("503"));
    }
    assert!(h.messenger.texts_to(BOUND_CHAT).is_empty());

    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.failed, 1);

    let job = job_repo::find_by_id(&h.db, job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, job.max_attempts);
    assert!(invoice_repo::find_by_job_id(&h.db, job_id).unwrap().is_none());
    assert_eq!(storage.calls.load(Ordering::SeqCst), 3);

    // Nothing left to claim; the ceiling holds.
    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.claimed, 0);
    let job = job_repo::find_by_id(&h.db, job_id).unwrap().unwrap();
    assert_eq!(job.attempts, 3);

    assert_eq!(
        h.messenger.texts_to(BOUND_CHAT),
        vec![messages::PROCESSING_FAILED.to_string()]
    );
}

#[tokio::test]
async fn test_missing_credentials_fail_immediately() {
    let h = Harness::new();
    credential_repo::delete(&h.db, h.tenant_id).unwrap();
    let storage = Arc::new(FailingStorage::default());
    let worker = h.worker(Arc::new(FixedExtraction::with_confidence(90.0)), storage.clone());
    let job_id = h.enqueue("photo-d");

    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.failed, 1);

    let job = job_repo::find_by_id(&h.db, job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert!(job.last_error.unwrap().contains("credentials"));
    assert_eq!(h.messenger.downloads.load(Ordering::SeqCst), 0);
    assert_eq!(storage.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_one_failure_does_not_abort_batch() {
    let h = Harness::new();
    let worker = h.worker(
        Arc::new(FixedExtraction::with_confidence(85.0)),
        Arc::new(MemoryStorage::default()),
    );
    let first = h.enqueue("photo-1");
    let second = h.enqueue("photo-2");

    // A job for a tenant without credentials, queued between the two.
    let other = {
        let fiscal_id = contabot::FiscalId::parse("00112345678").unwrap();
        contabot::db::tenant_repo::insert_tenant(&h.db, None, "Sin Drive", "001-1234567-8", &fiscal_id)
            .unwrap()
    };
    let orphan = job_repo::enqueue(
        &h.db,
        &contabot::worker::NewJob {
            tenant_id: other,
            submitter_id: h.submitter_id,
            attachment_ref: "photo-x".into(),
            attachment_kind: contabot::worker::AttachmentKind::Photo,
            mime_type: "image/png".into(),
            file_ext: "png".into(),
            correlation_id: "msg-x".into(),
        },
        3,
    )
    .unwrap();
    let third = h.enqueue("photo-3");

    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.claimed, 4);
    assert_eq!(report.completed, 3);
    assert_eq!(report.failed, 1);

    for id in [first, second, third] {
        let job = job_repo::find_by_id(&h.db, id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }
    let job = job_repo::find_by_id(&h.db, orphan).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
}

#[tokio::test]
async fn test_rerun_reuses_existing_invoice() {
    let h = Harness::new();
    let storage = Arc::new(MemoryStorage::default());
    let worker = h.worker(Arc::new(FixedExtraction::with_confidence(99.0)), storage.clone());
    let job_id = h.enqueue("photo-e");

    // A previous run persisted the invoice but died before completing the job.
    let (invoice_id, _) = invoice_repo::insert_for_job(
        &h.db,
        &NewInvoice {
            tenant_id: h.tenant_id,
            submitter_id: h.submitter_id,
            job_id,
            fields: InvoiceFields::default(),
            confidence_score: 99.0,
            storage_url: "https://files.example/earlier".into(),
            notes: None,
        },
    )
    .unwrap();

    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.completed, 1);
    assert!(storage.uploads.lock().unwrap().is_empty());

    let invoices = invoice_repo::list(
        &h.db,
        &InvoiceFilter {
            tenant_id: Some(h.tenant_id),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(invoices.len(), 1);
    assert_eq!(invoices[0].id, invoice_id);
    assert_eq!(
        job_repo::find_by_id(&h.db, job_id).unwrap().unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn test_overlapping_cycle_is_skipped() {
    let h = Harness::new();
    let worker = h.worker(
        Arc::new(FixedExtraction::with_confidence(90.0).slow(Duration::from_millis(50))),
        Arc::new(MemoryStorage::default()),
    );
    h.enqueue("photo-f");

    let (first, second) = tokio::join!(worker.run_cycle(), worker.run_cycle());
    let (first, second) = (first.unwrap(), second.unwrap());
    let (ran, skipped) = if first.skipped {
        (second, first)
    } else {
        (first, second)
    };

    assert!(!ran.skipped);
    assert_eq!(ran.claimed, 1);
    assert!(skipped.skipped);
    assert_eq!(skipped.claimed, 0);
    assert!(!worker.is_running_cycle());
}

#[tokio::test]
async fn test_job_store_error_releases_rest_of_batch() {
    let h = Harness::new();
    let worker = h.worker(
        Arc::new(FixedExtraction::with_confidence(90.0)),
        Arc::new(MemoryStorage::default()),
    );
    let first = h.enqueue("photo-a");
    let second = h.enqueue("photo-b");

    h.db.with_conn(|c| {
        Ok(c.execute_batch(
            "CREATE TRIGGER fail_completion BEFORE UPDATE OF status ON jobs
             WHEN NEW.status = 'completed' AND OLD.attachment_ref = 'photo-a'
             BEGIN SELECT RAISE(ABORT, 'io error'); END;",
        )?)
    })
    .unwrap();
    assert!(worker.run_cycle().await.is_err());

    for id in [first, second] {
        let job = job_repo::find_by_id(&h.db, id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
    }

    h.db.with_conn(|c| Ok(c.execute_batch("DROP TRIGGER fail_completion;")?))
        .unwrap();
    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.claimed, 2);
    assert_eq!(report.completed, 2);
    assert_eq!(
        invoice_repo::list(&h.db, &InvoiceFilter::default()).unwrap().len(),
        2
    );
}

#[tokio::test]
async fn test_recover_requeues_interrupted_jobs() {
    let h = Harness::new();
    let worker = h.worker(
        Arc::new(FixedExtraction::with_confidence(90.0)),
        Arc::new(MemoryStorage::default()),
    );
    let job_id = h.enqueue("photo-g");
    let claimed = job_repo::claim_batch(&h.db, 10, chrono::Utc::now()).unwrap();
    assert_eq!(claimed.len(), 1);

    assert_eq!(worker.recover().unwrap(), 1);
    let job = job_repo::find_by_id(&h.db, job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.completed, 1);
}

#[tokio::test]
async fn test_run_stops_on_request() {
    let h = Harness::new();
    let worker = Arc::new(h.worker(
        Arc::new(FixedExtraction::with_confidence(90.0)),
        Arc::new(MemoryStorage::default()),
    ));
    let job_id = h.enqueue("photo-h");

    let handle = tokio::spawn(worker.clone().run());
    for _ in 0..50 {
        let job = job_repo::find_by_id(&h.db, job_id).unwrap().unwrap();
        if job.status == JobStatus::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    worker.stop();

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("worker loop did not stop")
        .unwrap();
    assert_eq!(
        job_repo::find_by_id(&h.db, job_id).unwrap().unwrap().status,
        JobStatus::Completed
    );
}
