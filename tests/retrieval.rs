mod common;

use cold_backup::{
    errors::{EngineError, FailureKind},
    models::{
        archive::{Archive, NewArchive},
        retrieval_job::{RetrievalJob, RetrievalState},
    },
    remote::RemoteStorage,
    retry::Backoff,
    services::retrieval_coordinator::{PollOutcome, RetrievalCoordinator},
    treehash::tree_hash,
};
use common::{ConcatArchiver, Fixture, MIB, fixture, pattern};
use std::{
    path::Path,
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

fn coordinator(fx: &Fixture) -> RetrievalCoordinator {
    RetrievalCoordinator::new(
        fx.store.clone(),
        fx.remote.clone(),
        Arc::new(ConcatArchiver),
        fx.config.retrieval.clone(),
    )
}

async fn stored_archive(fx: &Fixture, path: &str, data: &[u8]) -> Archive {
    let remote_id = fx.remote.put_archive(data);
    fx.store
        .insert_archive(&NewArchive {
            path: path.into(),
            vault_id: fx.vault.id,
            remote_id,
            content_hash: tree_hash(data),
            size_bytes: data.len() as i64,
            remote_location: "/photos/archives/x".into(),
        })
        .await
        .unwrap()
}

/// Register a job without starting the background poller.
async fn queued_job(fx: &Fixture, archive: &Archive, destination: &Path) -> RetrievalJob {
    let initiated = fx
        .remote
        .initiate_retrieval_job(&fx.vault.name, &archive.remote_id)
        .await
        .unwrap();
    fx.store
        .create_retrieval_job(
            &initiated.job_id,
            fx.vault.id,
            archive.id,
            &destination.to_string_lossy(),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn job_is_polled_until_ready_then_restored() {
    let mut fx = fixture().await;
    fx.config.retrieval.chunk_size = MIB;
    fx.remote.polls_before_ready.store(3, Ordering::SeqCst);
    let data = pattern((5 * MIB / 2) as usize, 11);
    let archive = stored_archive(&fx, "photos.7z", &data).await;
    let destination = fx.dir.path().join("restore");
    let job = queued_job(&fx, &archive, &destination).await;
    let retrievals = coordinator(&fx);

    let mut last_polled = job.last_polled_at;
    for expected in 1..=3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        match retrievals.poll_once(&fx.vault).await.unwrap() {
            PollOutcome::NotReady { job: id, poll_count } => {
                assert_eq!(id, job.id);
                assert_eq!(poll_count, expected);
            }
            other => panic!("expected not ready, got {other:?}"),
        }
        let row = fx.store.retrieval_job(job.id).await.unwrap().unwrap();
        assert!(row.last_polled_at > last_polled);
        assert_eq!(row.state, RetrievalState::Polling);
        last_polled = row.last_polled_at;
    }

    match retrievals.poll_once(&fx.vault).await.unwrap() {
        PollOutcome::Restored { job: id, archive: archive_id, destination: dest } => {
            assert_eq!(id, job.id);
            assert_eq!(archive_id, archive.id);
            assert_eq!(dest, destination);
        }
        other => panic!("expected restore, got {other:?}"),
    }

    assert_eq!(fx.remote.range_calls.load(Ordering::SeqCst), 3);
    assert_eq!(std::fs::read(destination.join("restored.bin")).unwrap(), data);
    assert!(fx.store.retrieval_job(job.id).await.unwrap().is_none());
    assert!(!fx.config.retrieval.work_dir.join(format!("{}.archive", job.id)).exists());
    assert!(matches!(
        retrievals.poll_once(&fx.vault).await.unwrap(),
        PollOutcome::Idle
    ));
}

#[tokio::test]
async fn digest_mismatch_fails_the_job_and_keeps_the_row() {
    let fx = fixture().await;
    fx.remote.corrupt_output.store(true, Ordering::SeqCst);
    let data = pattern(4096, 2);
    let archive = stored_archive(&fx, "docs.7z", &data).await;
    let destination = fx.dir.path().join("restore");
    let job = queued_job(&fx, &archive, &destination).await;

    match coordinator(&fx).poll_once(&fx.vault).await.unwrap() {
        PollOutcome::Failed { job: id, kind } => {
            assert_eq!(id, job.id);
            assert_eq!(kind, FailureKind::Integrity);
        }
        other => panic!("expected integrity failure, got {other:?}"),
    }

    let row = fx.store.retrieval_job(job.id).await.unwrap().unwrap();
    assert_eq!(row.state, RetrievalState::Failed);
    assert!(row.last_error.unwrap().contains("digest mismatch"));
    assert!(!destination.exists());
    assert!(!fx.config.retrieval.work_dir.join(format!("{}.archive", job.id)).exists());
}

#[tokio::test]
async fn interrupted_download_reuses_finished_chunks() {
    let mut fx = fixture().await;
    fx.config.retrieval.chunk_size = MIB;
    let data = pattern((3 * MIB) as usize, 5);
    let archive = stored_archive(&fx, "music.7z", &data).await;
    let destination = fx.dir.path().join("restore");
    let job = queued_job(&fx, &archive, &destination).await;
    let retrievals = coordinator(&fx);

    // The first chunk is already on disk from an earlier attempt; the next
    // fetch fails.
    let chunk_dir = fx.config.retrieval.work_dir.join(job.id.to_string());
    std::fs::create_dir_all(&chunk_dir).unwrap();
    std::fs::write(
        chunk_dir.join(format!("0-{}.chunk", MIB - 1)),
        &data[..MIB as usize],
    )
    .unwrap();
    fx.remote.fail_ranges.store(1, Ordering::SeqCst);

    match retrievals.poll_once(&fx.vault).await.unwrap() {
        PollOutcome::Retrying { job: id, attempts } => {
            assert_eq!(id, job.id);
            assert_eq!(attempts, 1);
        }
        other => panic!("expected retry, got {other:?}"),
    }
    let row = fx.store.retrieval_job(job.id).await.unwrap().unwrap();
    assert_ne!(row.state, RetrievalState::Failed);

    assert!(matches!(
        retrievals.poll_once(&fx.vault).await.unwrap(),
        PollOutcome::Restored { .. }
    ));
    // One failed fetch plus the two chunks that were not on disk.
    assert_eq!(fx.remote.range_calls.load(Ordering::SeqCst), 3);
    assert_eq!(std::fs::read(destination.join("restored.bin")).unwrap(), data);
}

#[tokio::test]
async fn duplicate_retrievals_are_rejected() {
    let mut fx = fixture().await;
    fx.remote.polls_before_ready.store(1000, Ordering::SeqCst);
    fx.config.retrieval.poll_backoff = Backoff::new(Duration::from_secs(60), Duration::from_secs(60));
    let archive = stored_archive(&fx, "photos.7z", &pattern(100, 1)).await;
    let retrievals = coordinator(&fx);
    let destination = fx.dir.path().join("restore");

    retrievals
        .initiate_retrieval(archive.id, &destination)
        .await
        .unwrap();
    let err = retrievals
        .initiate_retrieval(archive.id, &destination)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::RetrievalAlreadyActive(id) if id == archive.id));
    assert_eq!(err.kind(), FailureKind::Invariant);

    retrievals.shutdown();
    retrievals.wait_for_idle().await;
}

#[tokio::test]
async fn waiting_for_idle_keeps_the_running_poller_registered() {
    let mut fx = fixture().await;
    fx.remote.polls_before_ready.store(1000, Ordering::SeqCst);
    fx.config.retrieval.poll_backoff = Backoff::new(Duration::from_secs(60), Duration::from_secs(60));
    let first = stored_archive(&fx, "a.7z", &pattern(100, 1)).await;
    let second = stored_archive(&fx, "b.7z", &pattern(200, 2)).await;
    let retrievals = coordinator(&fx);

    let job_a = retrievals
        .initiate_retrieval(first.id, &fx.dir.path().join("restore-a"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let waiter = {
        let retrievals = retrievals.clone();
        tokio::spawn(async move { retrievals.wait_for_idle().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let job_b = retrievals
        .initiate_retrieval(second.id, &fx.dir.path().join("restore-b"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // A second loop would have polled straight away instead of sleeping out
    // the backoff.
    let a = fx.store.retrieval_job(job_a.id).await.unwrap().unwrap();
    let b = fx.store.retrieval_job(job_b.id).await.unwrap().unwrap();
    assert_eq!(a.poll_count, 1);
    assert_eq!(b.poll_count, 0);
    assert!(!waiter.is_finished());

    retrievals.shutdown();
    waiter.await.unwrap();
}

#[tokio::test]
async fn background_poller_restores_and_stops() {
    let fx = fixture().await;
    fx.remote.polls_before_ready.store(2, Ordering::SeqCst);
    let first = stored_archive(&fx, "a.7z", &pattern(3000, 1)).await;
    let second = stored_archive(&fx, "b.7z", &pattern(5000, 2)).await;
    let retrievals = coordinator(&fx);

    let dest_a = fx.dir.path().join("restore-a");
    let dest_b = fx.dir.path().join("restore-b");
    retrievals.initiate_retrieval(first.id, &dest_a).await.unwrap();
    retrievals.initiate_retrieval(second.id, &dest_b).await.unwrap();
    retrievals.wait_for_idle().await;

    assert_eq!(std::fs::read(dest_a.join("restored.bin")).unwrap(), pattern(3000, 1));
    assert_eq!(std::fs::read(dest_b.join("restored.bin")).unwrap(), pattern(5000, 2));
    assert!(fx.store.retrieval_jobs(fx.vault.id).await.unwrap().is_empty());
}
