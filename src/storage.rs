//! Backing object storage for table data and metadata.
use std::sync::Arc;
use std::collections::HashMap;

use url::Url;
use bytes::Bytes;
use object_store::{
    ObjectStore,
    PutMode,
    Error as ObjectStoreError,
    local::LocalFileSystem,
    memory::InMemory,
    aws::{AmazonS3Builder, AmazonS3ConfigKey},
    path::{Path, PathPart},
    path::Error as PathError
};
use futures::StreamExt;
use lazy_static::lazy_static;

use crate::{TableResult, TableError};

enum StorageType {
    Local,
    S3,
    Memory,
}

/// Represents the storage of a warehouse of tables.
pub struct TableStorage {
    // URI containing the root location, e.g.
    // file:///path/to/warehouse or s3://bucket-name/path/to/warehouse
    location: Url,
    // Object storage backend, e.g. a cloud object store like S3 or an abstraction
    // over the local file system.
    object_store: Arc<dyn ObjectStore>,
    storage_type: StorageType,
}

impl TableStorage {
    /// Ensures a url to a local directory is valid, normalizes it
    /// and creates missing directories.
    fn setup_local_path(location: Url) -> TableResult<Url> {
        let path = location.to_file_path().map_err(|_| {
            TableError::InvalidTableLocation(format!(
                "invalid local location: {}", location
            ))
        })?;

        if path.exists() {
            if !path.is_dir() {
                return Err(TableError::InvalidTableLocation(format!(
                    "location exists, but is not a directory: {}", location
                )));
            }
        } else {
            std::fs::create_dir_all(&path).map_err(|_| {
                TableError::InvalidTableLocation(format!(
                    "could not create local directory: {}", path.display()
                ))
            })?;
        }

        let path = std::fs::canonicalize(path).map_err(|_| {
            TableError::InvalidTableLocation(format!(
                "failed to canonicalize location: {}", location
            ))
        })?;

        let url = Url::from_directory_path(path).map_err(|_| {
            TableError::InvalidTableLocation(format!(
                "directory path must be absolute: {}", location
            ))
        })?;

        Ok(url)
    }

    /// Initializes a new TableStorage from a URL and storage options.
    ///
    /// The URL determines the type of the backing object store. For example,
    /// `s3://bucket/warehouse/` will create an S3-backed store,
    /// `file:///path/to/warehouse` will create it on the local filesystem and
    /// `memory:///warehouse` keeps everything in memory.
    ///
    /// `storage_options` may include specific options like access credentials.
    /// For S3, any [`AmazonS3ConfigKey`] is accepted, e.g. `"aws_access_key_id"`,
    /// `"aws_secret_access_key"`, `"aws_region"` or `"aws_endpoint"`.
    pub fn from_url(
        location: &str,
        storage_options: HashMap<String, String>
    ) -> TableResult<Self> {
        // Always store the URL as a directory, needed when
        // calculating relative paths using Url::make_relative().
        let mut location = location.to_string();
        if !location.ends_with('/') {
            location.push('/');
        }

        let url = Url::parse(&location).map_err(|e| {
            TableError::InvalidTableLocation(format!(
                "invalid url {}: {}", location, e
            ))
        })?;

        match url.scheme() {
            "file" => {
                let url = TableStorage::setup_local_path(url)?;
                let object_store = LocalFileSystem::new_with_prefix(url.path())?;

                Ok(TableStorage {
                    location: url,
                    object_store: Arc::new(object_store),
                    storage_type: StorageType::Local
                })
            },
            "s3" => {
                let bucket = url.host_str()
                    .ok_or_else(|| {
                        TableError::InvalidTableLocation(format!(
                            "missing S3 bucket name: {}", location
                        ))
                    })?;

                let mut builder = AmazonS3Builder::new().with_bucket_name(bucket);
                for (key, value) in storage_options {
                    let key = key.to_ascii_lowercase().parse::<AmazonS3ConfigKey>()?;
                    builder = builder.with_config(key, value);
                }

                Ok(TableStorage {
                    location: url,
                    object_store: Arc::new(builder.build()?),
                    storage_type: StorageType::S3
                })
            },
            "memory" => {
                Ok(TableStorage {
                    location: url,
                    object_store: Arc::new(InMemory::new()),
                    storage_type: StorageType::Memory
                })
            },
            scheme => {
                Err(TableError::InvalidTableLocation(format!(
                    "URL scheme {} not supported", scheme
                )))
            }
        }
    }

    /// Creates an empty in-memory storage at `memory:///`.
    pub fn in_memory() -> Self {
        TableStorage {
            location: MEMORY_ROOT.clone(),
            object_store: Arc::new(InMemory::new()),
            storage_type: StorageType::Memory
        }
    }

    pub fn location(&self) -> &str {
        self.location.as_str().trim_end_matches('/')
    }

    /// Returns a reference to the underlying object store.
    pub fn object_store(&self) -> Arc<dyn ObjectStore> {
        self.object_store.clone()
    }

    /// Converts a storage path to the object store path.
    ///
    /// Returns `None` when the result is the root of the object store.
    fn to_object_store_path(&self, path: Option<&StoragePath>) -> Option<Path> {
        match self.storage_type {
            StorageType::Local | StorageType::Memory => {
                // Paths relative to the root location.
                path.map(|p| p.inner.clone())
            },
            StorageType::S3 => {
                // On S3 storage we have to use the full path inside the bucket.
                let prefix = self.location.path().trim_matches('/');
                match (path, prefix.is_empty()) {
                    (Some(path), true) => Some(path.inner.clone()),
                    (Some(path), false) => {
                        Some(Path::from(format!("{}/{}", prefix, path.as_ref())))
                    },
                    (None, true) => None,
                    (None, false) => Some(Path::from(prefix)),
                }
            }
        }
    }

    fn object_path(&self, path: &StoragePath) -> Path {
        self.to_object_store_path(Some(path))
            .unwrap_or_else(|| path.inner.clone())
    }

    /// Converts an object store path to a storage path.
    /// May fail if the path is not under the root location.
    fn to_storage_path(&self, path: Path) -> TableResult<StoragePath> {
        match self.storage_type {
            StorageType::Local | StorageType::Memory => {
                Ok(StoragePath { inner: path })
            },
            StorageType::S3 => {
                // On S3, the object store path is relative to the bucket, not to the
                // root location. Manually remove the location's path from each object.
                let prefix = self.location.path();

                path.prefix_match(&Path::from(prefix))
                    .map(|parts| {
                        StoragePath { inner: Path::from_iter(parts) }
                    })
                    .ok_or_else(|| {
                        TableError::InvalidPath {
                            source: PathError::PrefixMismatch {
                                path: path.to_string(),
                                prefix: prefix.to_string()
                            }
                        }
                    })
            }
        }
    }

    /// Wraps the put() method of the underlying object store.
    pub async fn put(&self, path: &StoragePath, bytes: Bytes) -> TableResult<()> {
        self.object_store
            .put(&self.object_path(path), bytes)
            .await?;

        Ok(())
    }

    /// Writes an object only if no object exists at `path`.
    ///
    /// Returns `false` without writing if the object already exists. This is the
    /// atomic primitive used to commit metadata versions.
    pub async fn put_if_absent(&self, path: &StoragePath, bytes: Bytes) -> TableResult<bool> {
        let result = self.object_store
            .put_opts(&self.object_path(path), bytes, PutMode::Create.into())
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(ObjectStoreError::AlreadyExists { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Wraps the get() method of the underlying object store.
    pub async fn get(&self, path: &StoragePath) -> TableResult<Bytes> {
        let res = self.object_store
            .get(&self.object_path(path))
            .await?;

        let bytes = res.bytes().await?;

        Ok(bytes)
    }

    /// Wraps the `delete()` method of the underlying object store.
    pub async fn delete(&self, path: &StoragePath) -> TableResult<()> {
        self.object_store.delete(&self.object_path(path)).await?;

        Ok(())
    }

    pub async fn list(
        &self,
        path: Option<&StoragePath>
    ) -> TableResult<Vec<StorageObjectMeta>> {
        let prefix = self.to_object_store_path(path);
        let mut stream = self.object_store.list(prefix.as_ref());

        let mut objects: Vec<StorageObjectMeta> = Vec::new();

        while let Some(obj_meta) = stream.next().await {
            // Exit early if any objects can't be listed.
            // We exclude the special case of a not found error on some of the list entities.
            // This error mainly occurs for local stores when a temporary file has been deleted by
            // concurrent writers.
            let obj_meta = match obj_meta {
                Ok(meta) => Ok(meta),
                Err(ObjectStoreError::NotFound { .. }) => continue,
                Err(err) => Err(err),
            }?;

            objects.push(StorageObjectMeta {
                location: self.to_storage_path(obj_meta.location)?,
                size: obj_meta.size
            });
        }

        Ok(objects)
    }

    /// Creates a StoragePath with the relative path to an object from its full URL.
    pub fn create_path_from_url(&self, url: &str) -> TableResult<StoragePath> {
        let url = Url::parse(url).map_err(|_| {
            TableError::InvalidTableLocation(format!(
                "invalid absolute object path: {}", url
            ))
        })?;

        let relative_path = self.location.make_relative(&url).ok_or_else(||
            TableError::InvalidTableLocation(format!(
                "invalid object path {}: can't be made relative to the root location",
                url
            ))
        )?;

        Ok(StoragePath { inner: Path::parse(relative_path)? })
    }

    pub fn to_uri(&self, path: &StoragePath) -> String {
        format!("{}/{}", self.location(), path.as_ref())
    }
}

lazy_static! {
    static ref MEMORY_ROOT: Url = Url::parse("memory:///").unwrap();
}

/// Represents a path to a data or metadata file.
///
/// This struct wraps object_store::path::Path to handle complexities arising from
/// differences in how object_store handles local filesystems and object stores.
///
/// A StoragePath is always relative to the root location of the storage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoragePath {
    inner: object_store::path::Path,
}

impl StoragePath {
    pub fn filename(&self) -> Option<&str> {
        self.inner.filename()
    }

    /// Returns a new path with `part` appended.
    pub fn child(&self, part: &str) -> Self {
        Self { inner: self.inner.child(part) }
    }
}

impl AsRef<str> for StoragePath {
    fn as_ref(&self) -> &str {
        self.inner.as_ref()
    }
}

impl From<&str> for StoragePath {
    fn from(value: &str) -> Self {
        Self { inner: object_store::path::Path::from(value) }
    }
}

impl From<String> for StoragePath {
    fn from(value: String) -> Self {
        Self { inner: object_store::path::Path::from(value) }
    }
}

impl<I> FromIterator<I> for StoragePath
where
    I: Into<String>
{
    fn from_iter<T: IntoIterator<Item = I>>(iter: T) -> Self {
        Self {
            inner: Path::from_iter(
               T::into_iter(iter).map(|s| PathPart::from(s.into()))
            )
        }
    }
}

impl std::fmt::Display for StoragePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

/// Contains metadata about a stored object.
pub struct StorageObjectMeta {
    /// Location of the object relative to the root location.
    pub location: StoragePath,
    /// Size of the object in bytes.
    pub size: usize,
}
