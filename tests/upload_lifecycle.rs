mod common;

use async_trait::async_trait;
use common::{
    ADMIN, FailingBackend, GatedBackend, MemoryBackend, NORMAL_USER, TestApp, UPLOADER,
    dir_entries, read_target, setup, setup_custom, test_settings, upload_request,
};
use file_depot::{
    models::file::FileView,
    services::{
        ServiceError,
        permissions::{DbPermissions, UploadPermissions},
        reaper::Reaper,
    },
};
use futures::future::join_all;
use sqlx::SqlitePool;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::sync::Notify;

#[tokio::test]
async fn blocks_delivered_out_of_order_assemble_in_index_order() {
    let app = setup().await;
    let uploads = &app.state.uploads;
    let session = app.init(UPLOADER, 5).await;
    assert_eq!(session.blocks_count, 3);
    assert_eq!(session.block_size, 2);

    uploads
        .upload_block(UPLOADER, session.id, 1, "cd".into())
        .await
        .unwrap();
    uploads
        .upload_block(UPLOADER, session.id, 0, "ab".into())
        .await
        .unwrap();
    uploads
        .upload_block(UPLOADER, session.id, 2, "e".into())
        .await
        .unwrap();

    let file = uploads.finalize(UPLOADER, session.id, None).await.unwrap();
    assert_eq!(file.filename, "data.bin");
    assert_eq!(file.size, 5);
    assert_eq!(file.content_hash, "ab56b4d92b40713acc5af89985d4b786");

    uploads.wait_idle().await;

    let download = app.state.files.download(&file.id).await.unwrap();
    assert_eq!(read_target(&download.target).await, b"abcde");
    assert_eq!(app.storage_usage(app.storage_id).await, 5);
    assert_eq!(dir_entries(&app.assembled_dir()).await, 0);
}

#[tokio::test]
async fn finalize_on_incomplete_session_has_no_side_effects() {
    let app = setup().await;
    let uploads = &app.state.uploads;
    let session = app.init(UPLOADER, 5).await;
    uploads
        .upload_block(UPLOADER, session.id, 1, "cd".into())
        .await
        .unwrap();
    uploads
        .upload_block(UPLOADER, session.id, 0, "ab".into())
        .await
        .unwrap();
    let temp_dir = app.temp_dir_of(session.id).await;

    let err = uploads
        .finalize(UPLOADER, session.id, None)
        .await
        .unwrap_err();
    match err {
        ServiceError::Request(msg) => assert!(msg.contains("block 2"), "{}", msg),
        other => panic!("expected request error, got {:?}", other),
    }

    assert_eq!(app.file_count().await, 0);
    assert!(uploads.sessions().get(session.id).await.is_ok());
    assert!(temp_dir.join("0").exists());
    assert_eq!(uploads.quota().current().await.unwrap(), 5);

    // Completing it afterwards still works.
    uploads
        .upload_block(UPLOADER, session.id, 2, "e".into())
        .await
        .unwrap();
    uploads.finalize(UPLOADER, session.id, None).await.unwrap();
    uploads.wait_idle().await;
    assert_eq!(app.file_count().await, 1);
}

#[tokio::test]
async fn duplicate_block_is_rejected_and_first_content_kept() {
    let app = setup().await;
    let uploads = &app.state.uploads;
    let session = app.init(UPLOADER, 5).await;

    uploads
        .upload_block(UPLOADER, session.id, 0, "ab".into())
        .await
        .unwrap();
    let err = uploads
        .upload_block(UPLOADER, session.id, 0, "zz".into())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Request(_)));

    let temp_dir = app.temp_dir_of(session.id).await;
    assert_eq!(tokio::fs::read(temp_dir.join("0")).await.unwrap(), b"ab");
    // Only the committed block remains; the rejected payload was discarded.
    assert_eq!(dir_entries(&temp_dir).await, 1);
}

#[tokio::test]
async fn block_length_rules() {
    let app = setup().await;
    let uploads = &app.state.uploads;
    let session = app.init(UPLOADER, 5).await;

    // Short final block is accepted.
    uploads
        .upload_block(UPLOADER, session.id, 2, "e".into())
        .await
        .unwrap();

    // Non-final blocks must be exactly one block long.
    for payload in ["a", "abc"] {
        let err = uploads
            .upload_block(UPLOADER, session.id, 0, payload.into())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Request(_)), "{:?}", err);
    }

    // Index outside [0, count).
    let err = uploads
        .upload_block(UPLOADER, session.id, 3, "ab".into())
        .await
        .unwrap_err();
    match err {
        ServiceError::Request(msg) => assert!(msg.contains("out of range"), "{}", msg),
        other => panic!("expected request error, got {:?}", other),
    }
}

#[tokio::test]
async fn final_block_is_bounded_by_block_size() {
    let app = setup().await;
    let uploads = &app.state.uploads;
    let session = app.init(UPLOADER, 5).await;

    for payload in ["", "efg"] {
        let err = uploads
            .upload_block(UPLOADER, session.id, 2, payload.into())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Request(_)), "{:?}", err);
    }

    // A full-size final block fits the block size even past the announced total.
    uploads
        .upload_block(UPLOADER, session.id, 2, "ef".into())
        .await
        .unwrap();
}

#[tokio::test]
async fn short_final_block_is_accepted_but_wrong_total_fails_finalize() {
    let app = setup().await;
    let uploads = &app.state.uploads;
    let session = app.init(UPLOADER, 4).await;

    uploads
        .upload_block(UPLOADER, session.id, 0, "ab".into())
        .await
        .unwrap();
    uploads
        .upload_block(UPLOADER, session.id, 1, "c".into())
        .await
        .unwrap();

    let err = uploads
        .finalize(UPLOADER, session.id, None)
        .await
        .unwrap_err();
    match err {
        ServiceError::Request(msg) => assert!(msg.contains("announced 4"), "{}", msg),
        other => panic!("expected request error, got {:?}", other),
    }
    assert_eq!(app.file_count().await, 0);
    assert_eq!(uploads.quota().current().await.unwrap(), 0);
    assert_eq!(dir_entries(&app.assembled_dir()).await, 0);
}

#[tokio::test]
async fn other_users_cannot_touch_a_session() {
    let app = setup().await;
    let uploads = &app.state.uploads;
    let session = app.init(UPLOADER, 4).await;

    let err = uploads
        .upload_block(NORMAL_USER, session.id, 0, "ab".into())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Unauthorized(_)));

    app.upload_all(UPLOADER, session.id, b"abcd").await;
    let err = uploads
        .finalize(NORMAL_USER, session.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Unauthorized(_)));
    let err = uploads.cancel(NORMAL_USER, session.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::Unauthorized(_)));

    assert!(uploads.sessions().get(session.id).await.is_ok());
}

#[tokio::test]
async fn normal_users_are_limited_to_small_files() {
    let app = setup().await;
    let uploads = &app.state.uploads;

    let err = uploads
        .create_session(NORMAL_USER, upload_request(9))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Unauthorized(_)));

    uploads
        .create_session(NORMAL_USER, upload_request(8))
        .await
        .unwrap();
}

#[tokio::test]
async fn init_validates_name_and_size() {
    let app = setup().await;
    let uploads = &app.state.uploads;

    let mut req = upload_request(4);
    req.filename = "   ".into();
    assert!(matches!(
        uploads.create_session(UPLOADER, req).await,
        Err(ServiceError::Request(_))
    ));

    assert!(matches!(
        uploads.create_session(UPLOADER, upload_request(0)).await,
        Err(ServiceError::Request(_))
    ));
    assert!(matches!(
        uploads.create_session(UPLOADER, upload_request(1025)).await,
        Err(ServiceError::Request(_))
    ));

    let mut req = upload_request(4);
    req.storage_id = Some(999);
    assert!(matches!(
        uploads.create_session(UPLOADER, req).await,
        Err(ServiceError::NotFound(_))
    ));

    // Nothing was reserved by the rejected attempts.
    assert_eq!(uploads.quota().current().await.unwrap(), 0);
}

#[tokio::test]
async fn quota_ceiling_rejects_new_sessions() {
    let app = setup().await;
    let uploads = &app.state.uploads;

    for _ in 0..4 {
        app.init(UPLOADER, 1000).await;
    }
    let err = uploads
        .create_session(UPLOADER, upload_request(1000))
        .await
        .unwrap_err();
    match err {
        ServiceError::Request(msg) => assert!(msg.contains("server is busy"), "{}", msg),
        other => panic!("expected request error, got {:?}", other),
    }
    assert_eq!(uploads.quota().current().await.unwrap(), 4000);
}

#[tokio::test]
async fn quota_returns_to_baseline_after_finalize_cancel_and_expiry() {
    let app = setup().await;
    let uploads = &app.state.uploads;
    assert_eq!(uploads.quota().current().await.unwrap(), 0);

    let finalized = app.init(UPLOADER, 4).await;
    let cancelled = app.init(UPLOADER, 6).await;
    let expired = app.init(UPLOADER, 3).await;
    assert_eq!(uploads.quota().current().await.unwrap(), 13);

    app.upload_all(UPLOADER, finalized.id, b"wxyz").await;
    uploads
        .finalize(UPLOADER, finalized.id, None)
        .await
        .unwrap();
    uploads.cancel(UPLOADER, cancelled.id).await.unwrap();
    app.backdate_session(expired.id, 7200).await;
    let reaped = Reaper::new(uploads.clone()).run_sweep().await.unwrap();
    assert_eq!(reaped, 1);

    uploads.wait_idle().await;
    assert_eq!(uploads.quota().current().await.unwrap(), 0);
}

#[tokio::test]
async fn cancel_removes_session_and_temp_dir() {
    let app = setup().await;
    let uploads = &app.state.uploads;
    let session = app.init(UPLOADER, 4).await;
    uploads
        .upload_block(UPLOADER, session.id, 0, "ab".into())
        .await
        .unwrap();
    let temp_dir = app.temp_dir_of(session.id).await;

    uploads.cancel(UPLOADER, session.id).await.unwrap();
    assert!(matches!(
        uploads.sessions().get(session.id).await,
        Err(ServiceError::NotFound(_))
    ));
    assert_eq!(uploads.quota().current().await.unwrap(), 0);

    let err = uploads
        .upload_block(UPLOADER, session.id, 1, "cd".into())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));

    uploads.wait_idle().await;
    assert!(!temp_dir.exists());
}

#[tokio::test]
async fn concurrent_block_writes_all_land() {
    let app = setup().await;
    let data: Vec<u8> = (b'a'..=b't').collect();
    let session = app.init(UPLOADER, data.len() as u64).await;
    assert_eq!(session.blocks_count, 10);

    let writes = data.chunks(2).enumerate().map(|(index, chunk)| {
        let uploads = app.state.uploads.clone();
        let chunk = chunk.to_vec();
        let id = session.id;
        tokio::spawn(async move { uploads.upload_block(UPLOADER, id, index, chunk.into()).await })
    });
    for result in join_all(writes).await {
        result.unwrap().unwrap();
    }

    let stored = app.state.uploads.sessions().get(session.id).await.unwrap();
    assert!(stored.bitmap().unwrap().is_complete());

    let file = app
        .state
        .uploads
        .finalize(UPLOADER, session.id, None)
        .await
        .unwrap();
    app.state.uploads.wait_idle().await;
    let download = app.state.files.download(&file.id).await.unwrap();
    assert_eq!(read_target(&download.target).await, data);
}

#[tokio::test]
async fn concurrent_finalize_has_exactly_one_winner() {
    let app = setup().await;
    let session = app.init(UPLOADER, 4).await;
    app.upload_all(UPLOADER, session.id, b"abcd").await;

    let attempts = (0..2).map(|_| {
        let uploads = app.state.uploads.clone();
        let id = session.id;
        tokio::spawn(async move { uploads.finalize(UPLOADER, id, None).await })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .any(|r| matches!(r, Err(ServiceError::NotFound(_))))
    );

    app.state.uploads.wait_idle().await;
    assert_eq!(app.file_count().await, 1);
    assert_eq!(app.state.uploads.quota().current().await.unwrap(), 0);
}

#[tokio::test]
async fn checksum_mismatch_is_a_request_error() {
    let app = setup().await;
    let session = app.init(UPLOADER, 4).await;
    app.upload_all(UPLOADER, session.id, b"abcd").await;

    let err = app
        .state
        .uploads
        .finalize(
            UPLOADER,
            session.id,
            Some("00000000000000000000000000000000".into()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Request(_)));
    assert_eq!(app.file_count().await, 0);
    assert_eq!(dir_entries(&app.assembled_dir()).await, 0);
}

#[tokio::test]
async fn checksum_given_at_init_is_verified() {
    let app = setup().await;
    let mut req = upload_request(5);
    req.md5 = Some("AB56B4D92B40713ACC5AF89985D4B786".into());
    let session = app
        .state
        .uploads
        .create_session(UPLOADER, req)
        .await
        .unwrap();
    assert_eq!(
        session.content_hash.as_deref(),
        Some("ab56b4d92b40713acc5af89985d4b786")
    );

    app.upload_all(UPLOADER, session.id, b"abcde").await;
    app.state
        .uploads
        .finalize(UPLOADER, session.id, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn failed_relocation_removes_the_file_record() {
    let app = setup().await;
    app.use_backend(app.storage_id, Arc::new(FailingBackend));

    let session = app.init(UPLOADER, 4).await;
    app.upload_all(UPLOADER, session.id, b"abcd").await;
    let file = app
        .state
        .uploads
        .finalize(UPLOADER, session.id, None)
        .await
        .unwrap();
    assert!(!file.available);

    app.state.uploads.wait_idle().await;

    assert!(matches!(
        app.state.files.get(&file.id).await,
        Err(ServiceError::NotFound(_))
    ));
    assert!(matches!(
        app.state.files.download(&file.id).await,
        Err(ServiceError::NotFound(_))
    ));
    assert_eq!(app.storage_usage(app.storage_id).await, 0);
    assert_eq!(dir_entries(&app.assembled_dir()).await, 0);
}

/// Permissions that, on the first armed admin check, let the gated backend
/// finish and wait until relocation has recorded the storage key.
struct KeyRecordedDuringCheck {
    db: Arc<SqlitePool>,
    inner: DbPermissions,
    release: Arc<Notify>,
    armed: Arc<AtomicBool>,
}

#[async_trait]
impl UploadPermissions for KeyRecordedDuringCheck {
    async fn can_user_upload(&self, user_id: i64) -> anyhow::Result<bool> {
        self.inner.can_user_upload(user_id).await
    }

    async fn is_admin(&self, user_id: i64) -> anyhow::Result<bool> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.release.notify_one();
            for _ in 0..500 {
                let recorded: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE storage_key <> ''")
                        .fetch_one(&*self.db)
                        .await?;
                if recorded > 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
        self.inner.is_admin(user_id).await
    }
}

async fn finalize_gated(app: &TestApp, data: &[u8]) -> FileView {
    let session = app.init(UPLOADER, data.len() as u64).await;
    app.upload_all(UPLOADER, session.id, data).await;
    app.state
        .uploads
        .finalize(UPLOADER, session.id, None)
        .await
        .unwrap()
}

#[tokio::test]
async fn file_deleted_before_key_is_recorded_leaves_no_orphan() {
    let app = setup().await;
    let backend = Arc::new(GatedBackend::default());
    app.use_backend(app.storage_id, backend.clone());

    let file = finalize_gated(&app, b"abcd").await;
    app.state.files.delete(UPLOADER, &file.id).await.unwrap();
    assert_eq!(app.file_count().await, 0);

    backend.release.notify_one();
    app.state.uploads.wait_idle().await;

    assert_eq!(backend.inner.object_count(), 0);
    assert_eq!(app.storage_usage(app.storage_id).await, 0);
}

#[tokio::test]
async fn key_recorded_while_delete_checks_permissions_is_cleaned_up() {
    let release = Arc::new(Notify::new());
    let armed = Arc::new(AtomicBool::new(false));
    let (gate, trigger) = (release.clone(), armed.clone());
    let app = setup_custom(test_settings(), move |db| {
        Arc::new(KeyRecordedDuringCheck {
            inner: DbPermissions::new(db.clone()),
            db,
            release: gate,
            armed: trigger,
        }) as Arc<dyn UploadPermissions>
    })
    .await;
    let backend = Arc::new(GatedBackend {
        release,
        inner: MemoryBackend::default(),
    });
    app.use_backend(app.storage_id, backend.clone());

    let file = finalize_gated(&app, b"abcd").await;
    armed.store(true, Ordering::SeqCst);
    app.state.files.delete(ADMIN, &file.id).await.unwrap();
    app.state.uploads.wait_idle().await;

    assert_eq!(app.file_count().await, 0);
    assert_eq!(backend.inner.object_count(), 0);
    assert_eq!(backend.inner.deleted.lock().unwrap().len(), 1);
    assert_eq!(app.storage_usage(app.storage_id).await, 0);
}

#[tokio::test]
async fn reaper_only_expires_stale_sessions() {
    let app = setup().await;
    let uploads = &app.state.uploads;
    let stale = app.init(UPLOADER, 4).await;
    let fresh = app.init(UPLOADER, 6).await;
    uploads
        .upload_block(UPLOADER, stale.id, 0, "ab".into())
        .await
        .unwrap();
    let stale_dir = app.temp_dir_of(stale.id).await;
    app.backdate_session(stale.id, 2 * 3600).await;

    let reaped = Reaper::new(uploads.clone()).run_sweep().await.unwrap();
    assert_eq!(reaped, 1);
    assert!(!stale_dir.exists());
    assert!(matches!(
        uploads.sessions().get(stale.id).await,
        Err(ServiceError::NotFound(_))
    ));
    assert!(uploads.sessions().get(fresh.id).await.is_ok());
    assert_eq!(uploads.quota().current().await.unwrap(), 6);

    // A second sweep finds nothing left to do.
    assert_eq!(
        Reaper::new(uploads.clone()).run_sweep().await.unwrap(),
        0
    );
}

#[tokio::test]
async fn block_writes_keep_a_session_alive() {
    let app = setup().await;
    let uploads = &app.state.uploads;
    let session = app.init(UPLOADER, 4).await;
    app.backdate_session(session.id, 2 * 3600).await;

    uploads
        .upload_block(UPLOADER, session.id, 0, "ab".into())
        .await
        .unwrap();

    assert_eq!(
        Reaper::new(uploads.clone()).run_sweep().await.unwrap(),
        0
    );
}
