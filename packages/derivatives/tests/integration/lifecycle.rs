use common::{BlobRef, Fingerprint};
use derivatives::{
    AssetRepository, DerivativeDefinition, DerivativeError, DerivativeOutput, FileMetadata,
    LifecycleDirectives, MetadataOverride, Scheduled, StoredFile, TimingDirective,
    TransformError,
};

use crate::support::{TestEnv, registry, tagged};

fn upload(content: &[u8], filename: &str) -> DerivativeOutput {
    DerivativeOutput::bytes(content).with_metadata(MetadataOverride::default().filename(filename))
}

fn inline() -> LifecycleDirectives {
    LifecycleDirectives::default()
}

async fn thumb_env() -> TestEnv {
    TestEnv::new(registry(vec![tagged("thumb", "thumb")])).await
}

mod promotion {
    use super::*;

    #[tokio::test]
    async fn inline_promotion_creates_derivatives() {
        let env = thumb_env().await;
        let mut asset = env.service.create_asset().await.unwrap();

        let promotion = env
            .service
            .promote_primary_file(&mut asset, upload(b"abc123", "photo.jpg"), inline())
            .await
            .unwrap();

        assert_eq!(asset.fingerprint(), Some(Fingerprint::compute(b"abc123")));
        assert_eq!(asset.content_type(), Some("image/jpeg"));
        assert_eq!(promotion.file.metadata.size, 6);
        let Scheduled::Inline(Ok(created)) = promotion.derivatives else {
            panic!("expected inline derivative creation");
        };
        assert_eq!(created.keys().collect::<Vec<_>>(), vec!["thumb"]);
        assert!(asset.derivative_for("thumb").is_some());
        env.assert_no_orphans(&[asset.id()]).await;
    }

    #[tokio::test]
    async fn replacing_the_primary_file_drops_old_derivatives() {
        let env = thumb_env().await;
        let mut asset = env.service.create_asset().await.unwrap();
        let first = env
            .service
            .promote_primary_file(&mut asset, upload(b"one", "one.jpg"), inline())
            .await
            .unwrap();
        let old_thumb = asset.derivative_for("thumb").unwrap().file.blob.clone();

        let second = env
            .service
            .promote_primary_file(&mut asset, upload(b"two", "two.jpg"), inline())
            .await
            .unwrap();

        assert!(matches!(second.cleanup, Scheduled::Inline(Ok(2))));
        assert!(!env.store.contains(&first.file.blob.id));
        assert!(env.store.contains(&second.file.blob.id));
        assert!(!env.derivatives.contains(&old_thumb.id));

        let thumb = asset.derivative_for("thumb").unwrap();
        let bytes = env.service.storage().read(&thumb.file.blob).await.unwrap();
        assert_eq!(bytes, b"thumb:two");
        env.assert_no_orphans(&[asset.id()]).await;
    }

    #[tokio::test]
    async fn failed_inline_creation_keeps_the_promotion() {
        let env = TestEnv::new(registry(vec![DerivativeDefinition::new("thumb", |_, _| {
            Err(TransformError::failed("decoder crashed"))
        })]))
        .await;
        let mut asset = env.service.create_asset().await.unwrap();

        let promotion = env
            .service
            .promote_primary_file(&mut asset, upload(b"abc123", "photo.jpg"), inline())
            .await
            .unwrap();

        let Scheduled::Inline(Err(err)) = promotion.derivatives else {
            panic!("expected the inline creation error");
        };
        assert!(matches!(err, DerivativeError::Transform { ref key, .. } if key == "thumb"));
        assert!(matches!(promotion.cleanup, Scheduled::Inline(Ok(0))));
        assert!(env.store.contains(&promotion.file.blob.id));
        assert_eq!(asset.fingerprint(), Some(Fingerprint::compute(b"abc123")));
        env.assert_no_orphans(&[asset.id()]).await;
    }

    #[tokio::test]
    async fn disabled_directives_skip_hooks() {
        let env = thumb_env().await;
        let mut asset = env.service.create_asset().await.unwrap();
        let disabled = LifecycleDirectives::default()
            .create_derivatives(TimingDirective::Disabled)
            .delete(TimingDirective::Disabled);
        let first = env
            .service
            .promote_primary_file(&mut asset, upload(b"one", "one.jpg"), disabled)
            .await
            .unwrap();
        assert!(matches!(first.derivatives, Scheduled::Disabled));
        assert!(asset.derivatives().is_empty());

        let second = env
            .service
            .promote_primary_file(&mut asset, upload(b"two", "two.jpg"), disabled)
            .await
            .unwrap();
        assert!(matches!(second.cleanup, Scheduled::Disabled));
        assert!(env.store.contains(&first.file.blob.id));
    }

    #[tokio::test]
    async fn background_creation_runs_on_a_task() {
        let env = thumb_env().await;
        let mut asset = env.service.create_asset().await.unwrap();
        let directives = LifecycleDirectives::default()
            .create_derivatives(TimingDirective::Background)
            .delete(TimingDirective::Background);

        let promotion = env
            .service
            .promote_primary_file(&mut asset, upload(b"abc123", "photo.jpg"), directives)
            .await
            .unwrap();
        assert!(matches!(promotion.derivatives, Scheduled::Background(_)));

        let created = promotion.derivatives.finish().await.unwrap().unwrap();
        assert_eq!(created.keys().collect::<Vec<_>>(), vec!["thumb"]);
        assert_eq!(promotion.cleanup.finish().await.unwrap(), Some(0));

        let reloaded = env.service.load_asset(asset.id()).await.unwrap();
        assert!(reloaded.derivative_for("thumb").is_some());
    }

    #[tokio::test]
    async fn background_creation_skips_superseded_files() {
        let env = thumb_env().await;
        let mut asset = env.service.create_asset().await.unwrap();
        let directives =
            LifecycleDirectives::default().create_derivatives(TimingDirective::Background);

        let promotion = env
            .service
            .promote_primary_file(&mut asset, upload(b"abc123", "photo.jpg"), directives)
            .await
            .unwrap();
        // The spawned task has not run yet on this single-threaded runtime.
        let newer = StoredFile {
            blob: BlobRef::new("store", "newer.jpg"),
            metadata: FileMetadata {
                size: 5,
                sha512: Some(Fingerprint::compute(b"newer")),
                ..FileMetadata::default()
            },
        };
        env.repo.replace_primary_file(asset.id(), Some(newer)).await.unwrap();

        let created = promotion.derivatives.finish().await.unwrap().unwrap();
        assert!(created.is_empty());
        assert!(env.rows(asset.id()).await.is_empty());
        assert!(env.derivatives.ids().is_empty());
    }

    #[tokio::test]
    async fn promoting_onto_a_destroyed_asset_discards_the_upload() {
        let env = thumb_env().await;
        let mut asset = env.service.create_asset().await.unwrap();
        env.service
            .destroy_asset(asset.clone(), inline())
            .await
            .unwrap();

        let err = env
            .service
            .promote_primary_file(&mut asset, upload(b"late", "late.jpg"), inline())
            .await
            .unwrap_err();

        assert!(matches!(err, DerivativeError::AssetNotFound(id) if id == asset.id()));
        assert!(env.store.ids().is_empty());
    }
}

mod destruction {
    use super::*;

    #[tokio::test]
    async fn destroy_removes_rows_and_blobs() {
        let env = thumb_env().await;
        let mut asset = env.service.create_asset().await.unwrap();
        env.service
            .promote_primary_file(&mut asset, upload(b"abc123", "photo.jpg"), inline())
            .await
            .unwrap();
        let asset_id = asset.id();

        let destruction = env
            .service
            .destroy_asset(asset.clone(), inline())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(destruction.derivatives.len(), 1);
        assert!(matches!(destruction.cleanup, Scheduled::Inline(Ok(2))));
        assert!(env.store.ids().is_empty());
        assert!(env.derivatives.ids().is_empty());
        assert!(env.repo.find_asset(asset_id).await.unwrap().is_none());

        let again = env.service.destroy_asset(asset, inline()).await.unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn destroy_without_delete_keeps_blobs() {
        let env = thumb_env().await;
        let mut asset = env.service.create_asset().await.unwrap();
        env.service
            .promote_primary_file(&mut asset, upload(b"abc123", "photo.jpg"), inline())
            .await
            .unwrap();

        let destruction = env
            .service
            .destroy_asset(asset, LifecycleDirectives::default().delete(TimingDirective::Disabled))
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(destruction.cleanup, Scheduled::Disabled));
        assert_eq!(env.store.ids().len(), 1);
        assert_eq!(env.derivatives.ids().len(), 1);
    }
}
