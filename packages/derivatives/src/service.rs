use std::collections::BTreeMap;
use std::sync::Arc;

use common::StorageRegistry;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::config::DerivativesAppConfig;
use crate::creator::run_transforms;
use crate::definition::{DefinitionRegistry, DerivativeDefinition};
use crate::error::{DerivativeError, Result};
use crate::fingerprint::require_fingerprint;
use crate::model::{Asset, StoredFile};
use crate::persistence::{
    AddOptions, AddOutcome, Candidate, Persistence, RemoveOptions, RemoveOutcome, check_unsaved,
};
use crate::repository::AssetRepository;
use crate::resolver::{ResolveOptions, resolve};
use crate::source::DerivativeOutput;

/// Entry point for creating, adding and removing derivatives of assets.
///
/// Cheap to clone; clones share the repository, stores and definitions.
#[derive(Clone)]
pub struct DerivativeService {
    persistence: Persistence,
    definitions: DefinitionRegistry,
    config: Arc<DerivativesAppConfig>,
}

impl DerivativeService {
    pub fn new(
        repo: Arc<dyn AssetRepository>,
        storage: StorageRegistry,
        definitions: DefinitionRegistry,
        config: DerivativesAppConfig,
    ) -> Self {
        let persistence = Persistence::new(
            repo,
            storage,
            config.persistence.clone(),
            config.storage.derivative_storage_key.clone(),
        );
        Self {
            persistence,
            definitions,
            config: Arc::new(config),
        }
    }

    /// Build filesystem stores from `config.storage` and wire them up.
    pub async fn from_config(
        repo: Arc<dyn AssetRepository>,
        definitions: DefinitionRegistry,
        config: DerivativesAppConfig,
    ) -> Result<Self> {
        let storage = StorageRegistry::from_config(&config.storage).await?;
        Ok(Self::new(repo, storage, definitions, config))
    }

    pub fn definitions(&self) -> &DefinitionRegistry {
        &self.definitions
    }

    pub fn config(&self) -> &DerivativesAppConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<dyn AssetRepository> {
        self.persistence.repository()
    }

    pub fn storage(&self) -> &StorageRegistry {
        self.persistence.storage()
    }

    /// Insert a new asset with no primary file.
    pub async fn create_asset(&self) -> Result<Asset> {
        let record = self.repository().insert_asset(Uuid::now_v7(), None).await?;
        Ok(Asset::from_record(record, Vec::new()))
    }

    pub async fn load_asset(&self, id: Uuid) -> Result<Asset> {
        let record = self
            .repository()
            .find_asset(id)
            .await?
            .ok_or(DerivativeError::AssetNotFound(id))?;
        let derivatives = self.repository().list_derivatives(id).await?;
        Ok(Asset::from_record(record, derivatives))
    }

    /// Run the applicable definitions against the asset's primary file and
    /// persist what they produce.
    ///
    /// Returns an empty map when there is nothing to do, and also when the
    /// primary file changed while the transforms ran.
    #[instrument(skip_all, fields(asset_id = %asset.id()))]
    pub async fn create_derivatives(
        &self,
        asset: &mut Asset,
        options: ResolveOptions,
    ) -> Result<BTreeMap<String, StoredFile>> {
        if asset.file().is_none() {
            debug!("Asset has no primary file");
            return Ok(BTreeMap::new());
        }
        let add_options = AddOptions::default();
        check_unsaved(asset, add_options.allow_other_changes)?;
        require_fingerprint(asset)?;

        let selected: Vec<DerivativeDefinition> = resolve(
            &self.definitions,
            &options,
            asset.content_type(),
            &asset.derivative_keys(),
        )
        .into_iter()
        .cloned()
        .collect();
        if selected.is_empty() {
            debug!("No applicable derivative definitions");
            return Ok(BTreeMap::new());
        }

        let candidates = run_transforms(self.storage(), asset, selected).await?;
        if candidates.is_empty() {
            return Ok(BTreeMap::new());
        }

        let outcome = self
            .persistence
            .add(asset, candidates, &add_options)
            .await?;
        Ok(outcome.into_files())
    }

    /// Store caller-supplied derivatives, replacing any with the same keys.
    pub async fn add_derivatives<I, K, O>(
        &self,
        asset: &mut Asset,
        derivatives: I,
        options: &AddOptions,
    ) -> Result<AddOutcome>
    where
        I: IntoIterator<Item = (K, O)>,
        K: Into<String>,
        O: Into<DerivativeOutput>,
    {
        let by_key: BTreeMap<String, DerivativeOutput> = derivatives
            .into_iter()
            .map(|(key, output)| (key.into(), output.into()))
            .collect();
        let candidates = by_key
            .into_iter()
            .map(|(key, output)| Candidate {
                key,
                storage: None,
                output,
            })
            .collect();
        self.persistence.add(asset, candidates, options).await
    }

    pub async fn remove_derivatives<I, S>(
        &self,
        asset: &mut Asset,
        keys: I,
        options: &RemoveOptions,
    ) -> Result<RemoveOutcome>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        self.persistence.remove(asset, &keys, options).await
    }
}
