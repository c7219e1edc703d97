//! Named rules describing how to produce one derivative from a primary file.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;

use crate::error::TransformError;
use crate::model::FileMetadata;
use crate::source::DerivativeOutput;

/// Which primary-file content types a definition applies to.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum ContentTypeFilter {
    /// Applies to everything.
    #[default]
    Any,
    /// A main type such as `image`, matching `image/*`.
    MainType(String),
    /// A full type such as `image/jpeg`.
    Exact(String),
    /// Matches if any element matches.
    List(Vec<ContentTypeFilter>),
}

/// How closely a filter matched. Higher wins a key collision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Specificity {
    Unfiltered = 0,
    MainType = 1,
    Exact = 2,
}

impl ContentTypeFilter {
    /// `image/jpeg` becomes [`Exact`](Self::Exact), `image` becomes
    /// [`MainType`](Self::MainType).
    pub fn parse(filter: &str) -> Self {
        let filter = filter.trim().to_ascii_lowercase();
        if filter.contains('/') {
            Self::Exact(filter)
        } else {
            Self::MainType(filter)
        }
    }

    pub fn list<I, S>(filters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::List(filters.into_iter().map(|f| Self::parse(f.as_ref())).collect())
    }

    pub fn matches(&self, content_type: Option<&str>) -> bool {
        self.specificity(content_type).is_some()
    }

    /// How specifically this filter matches `content_type`, or `None` if it
    /// does not match at all.
    pub fn specificity(&self, content_type: Option<&str>) -> Option<Specificity> {
        match self {
            Self::Any => Some(Specificity::Unfiltered),
            Self::MainType(main) => {
                let (ct_main, _) = split_content_type(content_type?)?;
                (ct_main == *main).then_some(Specificity::MainType)
            }
            Self::Exact(exact) => {
                let (ct_main, ct_sub) = split_content_type(content_type?)?;
                let matches = exact
                    .split_once('/')
                    .is_some_and(|(main, sub)| main == ct_main && sub == ct_sub);
                matches.then_some(Specificity::Exact)
            }
            Self::List(filters) => filters
                .iter()
                .filter_map(|f| f.specificity(content_type))
                .max(),
        }
    }
}

impl From<&str> for ContentTypeFilter {
    fn from(filter: &str) -> Self {
        Self::parse(filter)
    }
}

/// Lowercased (main, sub) with parameters stripped.
fn split_content_type(content_type: &str) -> Option<(String, String)> {
    let essence = content_type.split(';').next()?.trim().to_ascii_lowercase();
    let (main, sub) = essence.split_once('/')?;
    Some((main.to_string(), sub.to_string()))
}

/// Primary file handed to transforms, opened once per creation run.
pub struct SourceFile {
    file: File,
    path: PathBuf,
}

impl SourceFile {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rewind(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0)).map(|_| ())
    }

    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.file.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

impl Read for SourceFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for SourceFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

/// What a transform knows about the attachment it is deriving from.
#[derive(Clone, Debug)]
pub struct TransformContext {
    pub asset_id: Uuid,
    pub key: String,
    pub content_type: Option<String>,
    pub source_metadata: FileMetadata,
}

pub type TransformResult = Result<Option<DerivativeOutput>, TransformError>;

/// Transforms are synchronous and may block; they run off the async runtime.
/// Returning `Ok(None)` means "nothing to produce for this file".
pub type TransformFn = Arc<dyn Fn(&mut SourceFile, &TransformContext) -> TransformResult + Send + Sync>;

#[derive(Clone)]
pub struct DerivativeDefinition {
    key: String,
    content_type: ContentTypeFilter,
    default_create: bool,
    storage_key: Option<String>,
    transform: TransformFn,
}

impl DerivativeDefinition {
    pub fn new<F>(key: impl Into<String>, transform: F) -> Self
    where
        F: Fn(&mut SourceFile, &TransformContext) -> TransformResult + Send + Sync + 'static,
    {
        Self {
            key: key.into(),
            content_type: ContentTypeFilter::Any,
            default_create: true,
            storage_key: None,
            transform: Arc::new(transform),
        }
    }

    pub fn content_type(mut self, filter: impl Into<ContentTypeFilter>) -> Self {
        self.content_type = filter.into();
        self
    }

    /// Whether the definition runs when no `only` list is given. Default: true.
    pub fn default_create(mut self, default_create: bool) -> Self {
        self.default_create = default_create;
        self
    }

    /// Store results under this storage key instead of the default.
    pub fn storage(mut self, storage_key: impl Into<String>) -> Self {
        self.storage_key = Some(storage_key.into());
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn filter(&self) -> &ContentTypeFilter {
        &self.content_type
    }

    pub fn is_default(&self) -> bool {
        self.default_create
    }

    pub fn storage_key(&self) -> Option<&str> {
        self.storage_key.as_deref()
    }

    pub fn apply(&self, source: &mut SourceFile, ctx: &TransformContext) -> TransformResult {
        (self.transform)(source, ctx)
    }
}

impl fmt::Debug for DerivativeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivativeDefinition")
            .field("key", &self.key)
            .field("content_type", &self.content_type)
            .field("default_create", &self.default_create)
            .field("storage_key", &self.storage_key)
            .finish_non_exhaustive()
    }
}

/// Immutable, ordered list of definitions for one kind of asset.
///
/// Several definitions may share a key with different content-type filters;
/// resolution keeps the most specific match.
#[derive(Clone, Debug, Default)]
pub struct DefinitionRegistry {
    definitions: Arc<[DerivativeDefinition]>,
}

impl DefinitionRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Start a child configuration seeded with this registry's definitions.
    pub fn extend(&self) -> RegistryBuilder {
        RegistryBuilder {
            definitions: self.definitions.to_vec(),
        }
    }

    pub fn definitions(&self) -> &[DerivativeDefinition] {
        &self.definitions
    }

    /// Distinct keys in definition order.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::new();
        for def in self.definitions.iter() {
            if !keys.contains(&def.key()) {
                keys.push(def.key());
            }
        }
        keys
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    definitions: Vec<DerivativeDefinition>,
}

impl RegistryBuilder {
    /// Append a definition. Duplicate keys are kept.
    pub fn define(mut self, definition: DerivativeDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    /// Drop every definition for any of `keys`, whatever its filter.
    pub fn remove<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys: Vec<S> = keys.into_iter().collect();
        self.definitions
            .retain(|d| !keys.iter().any(|k| k.as_ref() == d.key()));
        self
    }

    pub fn build(self) -> DefinitionRegistry {
        DefinitionRegistry {
            definitions: self.definitions.into(),
        }
    }
}
