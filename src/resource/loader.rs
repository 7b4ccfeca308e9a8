use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::trace;

use crate::resource::resource::Resource;

/// The raw bytes of a resource, as handed to [`crate::resource::ResourceContent::update_content`].
#[derive(Debug, Clone, Default)]
pub struct ResourceLoadData {
    pub bytes: Vec<u8>,
    /// Used to detect outdated resources on reload.
    pub modified: Option<SystemTime>,
}

#[derive(Debug)]
pub enum LoadOutcome {
    Data(ResourceLoadData),
    Missing,
    NeedsImport,
}

/// Reads the data of resources of one type. Called from file access workers, so it may block.
pub trait ResourceTypeLoader: Send + Sync {
    fn open_data_stream(&self, resource: &Resource) -> anyhow::Result<LoadOutcome>;

    /// Whether the data changed since the resource was loaded. Unforced reloads are skipped
    /// when this is false.
    fn is_outdated(&self, resource: &Resource) -> bool {
        let _ = resource;
        true
    }
}

/// Loads resources from files below a data directory, the resource id being the relative path.
pub struct FileResourceLoader {
    root: PathBuf,
    import_source_extension: Option<String>,
}

impl FileResourceLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            import_source_extension: None,
        }
    }

    /// A missing file with a sibling `<id>.<extension>` reports [`LoadOutcome::NeedsImport`]
    /// instead of [`LoadOutcome::Missing`].
    pub fn with_import_source_extension(mut self, extension: impl Into<String>) -> Self {
        self.import_source_extension = Some(extension.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, resource: &Resource) -> PathBuf {
        self.root.join(resource.id())
    }

    fn import_source_of(&self, path: &Path) -> Option<PathBuf> {
        let extension = self.import_source_extension.as_ref()?;
        let mut source = path.as_os_str().to_owned();
        source.push(".");
        source.push(extension);
        Some(PathBuf::from(source))
    }
}

impl ResourceTypeLoader for FileResourceLoader {
    fn open_data_stream(&self, resource: &Resource) -> anyhow::Result<LoadOutcome> {
        let path = self.path_of(resource);
        match std::fs::read(&path) {
            Ok(bytes) => {
                let modified = std::fs::metadata(&path)?.modified().ok();
                trace!("Read {} bytes from {}", bytes.len(), path.display());
                Ok(LoadOutcome::Data(ResourceLoadData { bytes, modified }))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                if self
                    .import_source_of(&path)
                    .is_some_and(|source| source.is_file())
                {
                    Ok(LoadOutcome::NeedsImport)
                } else {
                    Ok(LoadOutcome::Missing)
                }
            }
            Err(err) => Err(anyhow::Error::new(err).context(format!("Reading {}", path.display()))),
        }
    }

    fn is_outdated(&self, resource: &Resource) -> bool {
        let Some(loaded) = resource.loaded_modification() else {
            return true;
        };

        std::fs::metadata(self.path_of(resource))
            .and_then(|metadata| metadata.modified())
            .map(|modified| modified != loaded)
            .unwrap_or(true)
    }
}
