use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use common::{BlobRef, Fingerprint};
use derivatives::{
    AddOptions, AddOutcome, AssetRepository, DerivativeError, DerivativeOutput, FileMetadata,
    MetadataOverride, PreconditionError, RepoError, StoredFile,
};

use crate::support::{TestEnv, registry, test_config};

fn other_primary() -> StoredFile {
    StoredFile {
        blob: BlobRef::new("store", "elsewhere/primary.jpg"),
        metadata: FileMetadata {
            size: 5,
            mime_type: Some("image/jpeg".into()),
            sha512: Some(Fingerprint::compute(b"other")),
            ..FileMetadata::default()
        },
    }
}

fn thumb(data: &str) -> [(&'static str, DerivativeOutput); 1] {
    [("thumb", DerivativeOutput::bytes(data))]
}

async fn empty_env() -> TestEnv {
    TestEnv::new(registry(vec![])).await
}

mod merging {
    use super::*;

    #[tokio::test]
    async fn add_returns_stored_files_and_refreshes_asset() {
        let env = empty_env().await;
        let mut asset = env.asset_with(b"abc123", "photo.jpg").await;
        let version = asset.lock_version();

        let outcome = env
            .service
            .add_derivatives(&mut asset, thumb("small"), &AddOptions::default())
            .await
            .unwrap();

        let AddOutcome::Persisted(files) = outcome else {
            panic!("expected persisted outcome");
        };
        let file = &files["thumb"];
        assert_eq!(file.metadata.size, 5);
        assert_eq!(file.blob.storage, "derivatives");
        assert!(file.blob.id.starts_with(&asset.id().to_string()));
        assert_eq!(asset.derivative_for("thumb").unwrap().file, *file);
        assert_eq!(asset.lock_version(), version + 1);
        env.assert_no_orphans(&[asset.id()]).await;
    }

    #[tokio::test]
    async fn replaced_blob_is_deleted_after_commit() {
        let env = empty_env().await;
        let mut asset = env.asset_with(b"abc123", "photo.jpg").await;
        let old = env
            .service
            .add_derivatives(&mut asset, thumb("v1"), &AddOptions::default())
            .await
            .unwrap()
            .into_files()
            .remove("thumb")
            .unwrap();
        env.events.clear();

        let still_there = Arc::new(AtomicBool::new(false));
        let (flag, store, old_id) = (still_there.clone(), env.derivatives.clone(), old.blob.id.clone());
        env.repo
            .before_next_commit(move |_| flag.store(store.contains(&old_id), Ordering::SeqCst))
            .await;

        let new = env
            .service
            .add_derivatives(&mut asset, thumb("v2"), &AddOptions::default())
            .await
            .unwrap()
            .into_files()
            .remove("thumb")
            .unwrap();

        assert!(still_there.load(Ordering::SeqCst), "old blob vanished before commit");
        let put = env.events.position(&format!("put:{}", new.blob.id)).unwrap();
        let commit = env
            .events
            .position(&format!("commit:{}", asset.lock_version()))
            .unwrap();
        let delete = env.events.position(&format!("delete:{}", old.blob.id)).unwrap();
        assert!(put < commit && commit < delete, "events: {:?}", env.events.snapshot());
        assert_eq!(env.row_count(asset.id(), "thumb").await, 1);
        env.assert_no_orphans(&[asset.id()]).await;
    }

    #[tokio::test]
    async fn concurrent_commit_of_another_key_is_kept() {
        let env = empty_env().await;
        let mut asset = env.asset_with(b"abc123", "photo.jpg").await;
        let asset_id = asset.id();
        let (other, _) = env
            .service
            .storage()
            .upload("derivatives", "other", Some("png"), b"other")
            .await
            .unwrap();
        let other_file = StoredFile {
            blob: other,
            metadata: FileMetadata {
                size: 5,
                ..FileMetadata::default()
            },
        };

        // Another writer commits "mono" between our reload and our commit.
        env.repo
            .before_next_commit(move |tables| {
                tables.insert_row(asset_id, "mono", other_file).unwrap();
                tables.bump_version(asset_id).unwrap();
            })
            .await;

        let outcome = env
            .service
            .add_derivatives(&mut asset, thumb("t"), &AddOptions::default())
            .await
            .unwrap();

        assert!(outcome.is_persisted());
        assert_eq!(
            asset.derivative_keys().into_iter().collect::<Vec<_>>(),
            vec!["mono", "thumb"]
        );
        env.assert_no_orphans(&[asset_id]).await;
    }

    #[tokio::test]
    async fn parallel_adds_for_different_keys_both_land() {
        let env = empty_env().await;
        let asset = env.asset_with(b"abc123", "photo.jpg").await;
        let (mut first, mut second) = (asset.clone(), asset.clone());
        let options = AddOptions::default();

        let (a, b) = tokio::join!(
            env.service.add_derivatives(&mut first, [("a", DerivativeOutput::bytes("a"))], &options),
            env.service.add_derivatives(&mut second, [("b", DerivativeOutput::bytes("b"))], &options),
        );
        assert!(a.unwrap().is_persisted());
        assert!(b.unwrap().is_persisted());

        assert_eq!(env.row_count(asset.id(), "a").await, 1);
        assert_eq!(env.row_count(asset.id(), "b").await, 1);
        env.assert_no_orphans(&[asset.id()]).await;
    }

    #[tokio::test]
    async fn call_options_override_storage_and_metadata() {
        let env = empty_env().await;
        let mut asset = env.asset_with(b"abc123", "photo.jpg").await;
        let options = AddOptions::default()
            .storage("store")
            .metadata(MetadataOverride::default().mime_type("image/webp").extra("quality", 80));

        let files = env
            .service
            .add_derivatives(&mut asset, thumb("webp"), &options)
            .await
            .unwrap()
            .into_files();

        let file = &files["thumb"];
        assert_eq!(file.blob.storage, "store");
        assert!(file.blob.id.ends_with(".webp"));
        assert_eq!(file.content_type(), Some("image/webp"));
        assert_eq!(file.metadata.extra["quality"], 80);
        assert!(env.store.contains(&file.blob.id));
    }
}

mod staleness {
    use super::*;

    #[tokio::test]
    async fn primary_replaced_before_commit_is_not_persisted() {
        let env = empty_env().await;
        let mut asset = env.asset_with(b"abc123", "photo.jpg").await;
        let asset_id = asset.id();
        env.repo
            .before_next_commit(move |tables| {
                tables.replace_primary_file(asset_id, Some(other_primary()));
            })
            .await;

        let outcome = env
            .service
            .add_derivatives(&mut asset, thumb("stale"), &AddOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome, AddOutcome::Stale);
        assert!(env.rows(asset_id).await.is_empty());
        assert!(env.derivatives.ids().is_empty());
    }

    #[tokio::test]
    async fn already_stale_asset_never_commits() {
        let env = empty_env().await;
        let mut asset = env.asset_with(b"abc123", "photo.jpg").await;
        env.repo
            .replace_primary_file(asset.id(), Some(other_primary()))
            .await
            .unwrap();
        env.events.clear();

        let outcome = env
            .service
            .add_derivatives(&mut asset, thumb("stale"), &AddOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome, AddOutcome::Stale);
        assert!(outcome.into_files().is_empty());
        assert!(!env.events.snapshot().iter().any(|e| e.starts_with("commit:")));
        env.assert_no_orphans(&[asset.id()]).await;
    }

    #[tokio::test]
    async fn destroyed_asset_is_not_persisted() {
        let env = empty_env().await;
        let mut asset = env.asset_with(b"abc123", "photo.jpg").await;
        let asset_id = asset.id();
        env.repo
            .before_next_commit(move |tables| {
                tables.remove_asset(asset_id);
            })
            .await;

        let outcome = env
            .service
            .add_derivatives(&mut asset, thumb("gone"), &AddOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome, AddOutcome::Stale);
        assert!(env.derivatives.ids().is_empty());
    }
}

mod preconditions {
    use super::*;

    #[tokio::test]
    async fn unsaved_changes_are_refused() {
        let env = empty_env().await;
        let mut asset = env.asset_with(b"abc123", "photo.jpg").await;
        asset.mark_changed("title");

        let err = env
            .service
            .add_derivatives(&mut asset, thumb("x"), &AddOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DerivativeError::Precondition(PreconditionError::UnsavedChanges { ref fields, .. }) if fields == "title"
        ));
        assert_eq!(env.derivatives.put_count(), 0);
    }

    #[tokio::test]
    async fn refused_add_still_removes_source_files() {
        let env = empty_env().await;
        let mut asset = env.asset_with(b"abc123", "photo.jpg").await;
        asset.mark_changed("title");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thumb.png");
        std::fs::write(&path, b"thumb").unwrap();

        let err = env
            .service
            .add_derivatives(
                &mut asset,
                [("thumb", DerivativeOutput::path(&path))],
                &AddOptions::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DerivativeError::Precondition(PreconditionError::UnsavedChanges { .. })
        ));
        assert!(!path.exists());
        assert_eq!(env.derivatives.put_count(), 0);
    }

    #[tokio::test]
    async fn unsaved_changes_can_be_allowed() {
        let env = empty_env().await;
        let mut asset = env.asset_with(b"abc123", "photo.jpg").await;
        asset.mark_changed("title");

        let outcome = env
            .service
            .add_derivatives(
                &mut asset,
                thumb("x"),
                &AddOptions::default().allow_other_changes(true),
            )
            .await
            .unwrap();

        assert!(outcome.is_persisted());
        assert!(asset.has_unsaved_changes());
    }
}

mod failures {
    use super::*;

    #[tokio::test]
    async fn failed_commit_discards_uploads_and_keeps_existing() {
        let env = empty_env().await;
        let mut asset = env.asset_with(b"abc123", "photo.jpg").await;
        let existing = env
            .service
            .add_derivatives(&mut asset, thumb("v1"), &AddOptions::default())
            .await
            .unwrap()
            .into_files();
        env.repo.fail_next_commit("connection reset").await;

        let err = env
            .service
            .add_derivatives(&mut asset, thumb("v2"), &AddOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, DerivativeError::Repository(RepoError::Backend(_))));
        let rows = env.rows(asset.id()).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].file, existing["thumb"]);
        env.assert_no_orphans(&[asset.id()]).await;
    }

    #[tokio::test]
    async fn failed_upload_discards_earlier_uploads() {
        let env = empty_env().await;
        let mut asset = env.asset_with(b"abc123", "photo.jpg").await;
        let missing = std::env::temp_dir().join(format!("missing-{}", uuid::Uuid::new_v4()));

        let err = env
            .service
            .add_derivatives(
                &mut asset,
                [
                    ("a", DerivativeOutput::bytes("a")),
                    ("b", DerivativeOutput::path(missing)),
                ],
                &AddOptions::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DerivativeError::Source(_)));
        assert_eq!(env.derivatives.put_count(), 1);
        assert!(env.derivatives.ids().is_empty());
        assert!(env.rows(asset.id()).await.is_empty());
    }

    #[tokio::test]
    async fn storage_failure_is_propagated() {
        let env = empty_env().await;
        let mut asset = env.asset_with(b"abc123", "photo.jpg").await;
        env.derivatives.fail_next_puts(1);

        let err = env
            .service
            .add_derivatives(&mut asset, thumb("x"), &AddOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, DerivativeError::Storage(_)));
        assert!(env.rows(asset.id()).await.is_empty());
    }

    #[tokio::test]
    async fn uniqueness_race_updates_the_winning_row() {
        let env = empty_env().await;
        let mut asset = env.asset_with(b"abc123", "photo.jpg").await;
        // The concurrent writer's blob is stored before its row shows up.
        let (winner_blob, size) = env
            .service
            .storage()
            .upload("derivatives", "winner", Some("png"), b"winner")
            .await
            .unwrap();
        let winner = StoredFile {
            blob: winner_blob.clone(),
            metadata: FileMetadata {
                size,
                ..FileMetadata::default()
            },
        };
        env.repo.inject_unique_violation(Some(winner)).await;

        let files = env
            .service
            .add_derivatives(&mut asset, thumb("mine"), &AddOptions::default())
            .await
            .unwrap()
            .into_files();

        let rows = env.rows(asset.id()).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].file, files["thumb"]);
        assert!(!env.derivatives.contains(&winner_blob.id));
        let commit = env
            .events
            .position(&format!("commit:{}", asset.lock_version()))
            .unwrap();
        let delete = env.events.position(&format!("delete:{}", winner_blob.id)).unwrap();
        assert!(commit < delete);
        env.assert_no_orphans(&[asset.id()]).await;
    }

    #[tokio::test]
    async fn exhausted_uniqueness_retries_fail_cleanly() {
        let env = empty_env().await;
        let mut asset = env.asset_with(b"abc123", "photo.jpg").await;
        for _ in 0..3 {
            env.repo.inject_unique_violation(None).await;
        }

        let err = env
            .service
            .add_derivatives(&mut asset, thumb("x"), &AddOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DerivativeError::Repository(RepoError::UniqueViolationExhausted { attempts: 3, .. })
        ));
        assert!(env.rows(asset.id()).await.is_empty());
        env.assert_no_orphans(&[asset.id()]).await;
    }

    #[tokio::test]
    async fn unique_retry_bound_is_configurable() {
        let mut config = test_config();
        config.persistence.unique_violation_attempts = 4;
        let env = TestEnv::with_config(registry(vec![]), config).await;
        let mut asset = env.asset_with(b"abc123", "photo.jpg").await;
        for _ in 0..3 {
            env.repo.inject_unique_violation(None).await;
        }

        let outcome = env
            .service
            .add_derivatives(&mut asset, thumb("x"), &AddOptions::default())
            .await
            .unwrap();
        assert!(outcome.is_persisted());
        assert_eq!(env.row_count(asset.id(), "thumb").await, 1);
    }

    #[tokio::test]
    async fn persistent_version_conflicts_give_up() {
        let mut config = test_config();
        config.persistence.max_commit_attempts = 2;
        let env = TestEnv::with_config(registry(vec![]), config).await;
        let mut asset = env.asset_with(b"abc123", "photo.jpg").await;
        let asset_id = asset.id();
        for _ in 0..2 {
            env.repo
                .before_next_commit(move |tables| {
                    tables.bump_version(asset_id);
                })
                .await;
        }

        let err = env
            .service
            .add_derivatives(&mut asset, thumb("x"), &AddOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, DerivativeError::CommitConflict { attempts: 2, .. }));
        env.assert_no_orphans(&[asset_id]).await;
    }
}

mod sources {
    use super::*;

    #[tokio::test]
    async fn path_sources_follow_delete_sources() {
        let env = empty_env().await;
        let mut asset = env.asset_with(b"abc123", "photo.jpg").await;
        let dir = tempfile::tempdir().unwrap();
        let kept = dir.path().join("kept.png");
        let removed = dir.path().join("removed.png");
        std::fs::write(&kept, b"kept").unwrap();
        std::fs::write(&removed, b"removed").unwrap();

        env.service
            .add_derivatives(
                &mut asset,
                [("kept", DerivativeOutput::path(&kept))],
                &AddOptions::default().delete_sources(false),
            )
            .await
            .unwrap();
        let files = env
            .service
            .add_derivatives(
                &mut asset,
                [("removed", DerivativeOutput::path(&removed))],
                &AddOptions::default(),
            )
            .await
            .unwrap()
            .into_files();

        assert!(kept.exists());
        assert!(!removed.exists());
        assert_eq!(files["removed"].metadata.filename.as_deref(), Some("removed.png"));
        assert_eq!(files["removed"].content_type(), Some("image/png"));
    }

    #[tokio::test]
    async fn temp_file_sources_are_always_removed() {
        let env = empty_env().await;
        let mut asset = env.asset_with(b"abc123", "photo.jpg").await;
        let temp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), b"tmp").unwrap();
        let path = temp.path().to_path_buf();

        env.service
            .add_derivatives(
                &mut asset,
                [("tmp", DerivativeOutput::temp_file(temp))],
                &AddOptions::default().delete_sources(false),
            )
            .await
            .unwrap();

        assert!(!path.exists());
    }
}
