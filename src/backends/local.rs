//! src/backends/local.rs
//!
//! LocalBackend — buckets as directories on local disk.
//!
//! Layout beneath `root`:
//! - `{bucket}/data/{key}`: object payloads
//! - `{bucket}/meta/{hh}/{md5(key)}.json`: sidecar with the key, content
//!   type, cached ETag and user metadata, sharded by the first two hex digits
//!   of the key's MD5 so no sidecar path can clash with a key's directories
//! - `{bucket}/tmp/`: in-flight uploads, renamed into `data/` once complete
//!
//! ETags are the hex MD5 of the payload. The sidecar caches the digest
//! together with the size and mtime it was computed for; a payload touched
//! outside this backend is re-hashed on the next listing.

use super::{ByteStream, StorageBackend, check_cancelled};
use crate::{
    errors::{BackendError, BackendResult},
    models::{ObjectDescriptor, UploadResult},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use md5::Context;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::{Component, Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tracing::{debug, warn};
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const HASH_BUFFER_LEN: usize = 64 * 1024;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Sidecar {
    key: String,
    content_type: String,
    etag: String,
    size: i64,
    modified: DateTime<Utc>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Clone, Debug)]
pub struct LocalBackend {
    /// Directory holding one sub-directory per bucket.
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reject keys that could escape the bucket directory or that do not map
    /// onto a regular file path.
    fn ensure_key_safe(key: &str) -> BackendResult<()> {
        let invalid = |reason: &str| {
            Err(BackendError::invalid_input(format!(
                "object key `{}` is invalid: {}",
                key, reason
            )))
        };

        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return invalid("length must be between 1 and 1024 bytes");
        }
        if key.starts_with('/') || key.ends_with('/') {
            return invalid("cannot begin or end with `/`");
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return invalid("contains control characters or backslashes");
        }
        if key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return invalid("contains empty, `.` or `..` segments");
        }
        Ok(())
    }

    /// Validate bucket name format.
    ///
    /// Enforces S3-like naming rules so bucket names stay valid directory names:
    /// - 3–63 characters
    /// - lowercase letters, digits, dots, hyphens only
    /// - cannot start/end with dot or hyphen
    /// - cannot contain consecutive dots or dot-hyphen patterns
    /// - cannot look like an IPv4 address
    fn ensure_bucket_name_safe(name: &str) -> BackendResult<()> {
        let invalid = |reason: &str| {
            Err(BackendError::invalid_input(format!(
                "bucket `{}` is invalid: {}",
                name, reason
            )))
        };

        let len = name.len();
        if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
            return invalid("must be between 3 and 63 characters");
        }
        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return invalid("allowed characters are lowercase letters, digits, dots, and hyphens");
        }
        if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
            return invalid("must start and end with a lowercase letter or digit");
        }
        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return invalid("cannot contain consecutive dots or dot-hyphen combinations");
        }
        if is_ipv4_like(name) {
            return invalid("must not be formatted like an IP address");
        }
        Ok(())
    }

    fn bucket_root(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    fn data_root(&self, bucket: &str) -> PathBuf {
        self.bucket_root(bucket).join("data")
    }

    fn meta_root(&self, bucket: &str) -> PathBuf {
        self.bucket_root(bucket).join("meta")
    }

    fn tmp_root(&self, bucket: &str) -> PathBuf {
        self.bucket_root(bucket).join("tmp")
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        let mut path = self.data_root(bucket);
        path.extend(key.split('/'));
        path
    }

    fn sidecar_path(&self, bucket: &str, key: &str) -> PathBuf {
        let hash = format!("{:x}", md5::compute(key.as_bytes()));
        self.meta_root(bucket)
            .join(&hash[0..2])
            .join(format!("{}.json", hash))
    }

    async fn require_bucket(&self, bucket: &str) -> BackendResult<()> {
        Self::ensure_bucket_name_safe(bucket)?;
        match fs::metadata(self.data_root(bucket)).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(BackendError::not_found(format!("bucket `{}` not found", bucket))),
            Err(err) => Err(BackendError::io(format!("bucket `{}` not found", bucket), err)),
        }
    }

    async fn read_sidecar(&self, bucket: &str, key: &str) -> Option<Sidecar> {
        let path = self.sidecar_path(bucket, key);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!("cannot read sidecar {}: {}", path.display(), err);
                return None;
            }
        };
        match serde_json::from_slice::<Sidecar>(&raw) {
            Ok(sidecar) if sidecar.key == key => Some(sidecar),
            Ok(sidecar) => {
                warn!(
                    "sidecar {} belongs to `{}`, not `{}`",
                    path.display(),
                    sidecar.key,
                    key
                );
                None
            }
            Err(err) => {
                warn!("ignoring corrupt sidecar {}: {}", path.display(), err);
                None
            }
        }
    }

    async fn write_sidecar(&self, bucket: &str, key: &str, sidecar: &Sidecar) -> BackendResult<()> {
        let path = self.sidecar_path(bucket, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| BackendError::io(format!("create {}", parent.display()), err))?;
        }
        let raw = serde_json::to_vec(sidecar).map_err(|err| {
            BackendError::new(crate::errors::BackendErrorKind::Other, "encode sidecar")
                .with_source(err)
        })?;
        fs::write(&path, raw)
            .await
            .map_err(|err| BackendError::io(format!("write {}", path.display()), err))
    }

    /// Build the descriptor of a stored payload, reusing the cached ETag when
    /// the sidecar still matches the file.
    async fn describe(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        cancel: &CancellationToken,
    ) -> BackendResult<ObjectDescriptor> {
        let meta = fs::metadata(path)
            .await
            .map_err(|err| BackendError::io(format!("stat object `{}`", key), err))?;
        let size = meta.len() as i64;
        let modified: DateTime<Utc> = meta
            .modified()
            .map_err(|err| BackendError::io(format!("read mtime of `{}`", key), err))?
            .into();

        let sidecar = self.read_sidecar(bucket, key).await;
        let etag = match &sidecar {
            Some(sc) if sc.size == size && sc.modified == modified => sc.etag.clone(),
            _ => hash_file(path, cancel).await?,
        };
        let (content_type, metadata) = match sidecar {
            Some(sc) => (sc.content_type, sc.metadata),
            None => (DEFAULT_CONTENT_TYPE.to_string(), HashMap::new()),
        };

        Ok(ObjectDescriptor {
            name: key.to_string(),
            bucket: bucket.to_string(),
            size,
            content_type,
            last_modified: modified,
            etag,
            metadata,
        })
    }

    /// Walk upwards from `start`, removing directories that became empty
    /// after a delete. `stop` itself is never removed.
    ///
    /// The walk ends at the first directory that is missing, still holds
    /// entries, or fails to be removed for any other reason (logged at
    /// debug level).
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

async fn hash_file(path: &Path, cancel: &CancellationToken) -> BackendResult<String> {
    let mut file = File::open(path)
        .await
        .map_err(|err| BackendError::io(format!("open {}", path.display()), err))?;
    let mut digest = Context::new();
    let mut buf = vec![0u8; HASH_BUFFER_LEN];
    loop {
        check_cancelled(cancel)?;
        let n = file
            .read(&mut buf)
            .await
            .map_err(|err| BackendError::io(format!("read {}", path.display()), err))?;
        if n == 0 {
            break;
        }
        digest.consume(&buf[..n]);
    }
    Ok(format!("{:x}", digest.compute()))
}

/// Object key of `path` relative to the bucket's data directory.
fn key_from_path(data_root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(data_root).ok()?;
    let mut segments = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(segment) => segments.push(segment.to_str()?),
            _ => return None,
        }
    }
    Some(segments.join("/"))
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn list_objects(
        &self,
        bucket: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<HashMap<String, ObjectDescriptor>> {
        check_cancelled(cancel)?;
        self.require_bucket(bucket).await?;

        let data_root = self.data_root(bucket);
        let mut objects = HashMap::new();
        let mut pending = vec![data_root.clone()];
        while let Some(dir) = pending.pop() {
            check_cancelled(cancel)?;
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|err| BackendError::io(format!("list {}", dir.display()), err))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| BackendError::io(format!("list {}", dir.display()), err))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|err| BackendError::io(format!("stat {}", path.display()), err))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }
                let Some(key) = key_from_path(&data_root, &path) else {
                    warn!("skipping non UTF-8 object path {}", path.display());
                    continue;
                };
                let descriptor = self.describe(bucket, &key, &path, cancel).await?;
                objects.insert(key, descriptor);
            }
        }

        debug!("listed {} objects in local bucket {}", objects.len(), bucket);
        Ok(objects)
    }

    async fn get_object(
        &self,
        bucket: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<(ObjectDescriptor, ByteStream)> {
        check_cancelled(cancel)?;
        Self::ensure_key_safe(name)?;
        self.require_bucket(bucket).await?;

        let path = self.object_path(bucket, name);
        let file = File::open(&path)
            .await
            .map_err(|err| BackendError::io(format!("open object `{}`", name), err))?;
        let descriptor = self.describe(bucket, name, &path, cancel).await?;
        Ok((descriptor, ReaderStream::new(file).boxed()))
    }

    /// Stream-upload an object to disk.
    ///
    /// - Writes bytes incrementally to a temporary file.
    /// - Computes MD5/etag and size while streaming.
    /// - Rejects bodies whose length differs from `size`.
    /// - Atomically renames into final location.
    ///
    /// Cleans up the temp file on every failure, including cancellation.
    async fn upload_object(
        &self,
        bucket: &str,
        name: &str,
        mut body: ByteStream,
        size: i64,
        content_type: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<UploadResult> {
        check_cancelled(cancel)?;
        Self::ensure_key_safe(name)?;
        self.require_bucket(bucket).await?;

        let tmp_root = self.tmp_root(bucket);
        fs::create_dir_all(&tmp_root)
            .await
            .map_err(|err| BackendError::io(format!("create {}", tmp_root.display()), err))?;
        let tmp_path = tmp_root.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path)
            .await
            .map_err(|err| BackendError::io(format!("create {}", tmp_path.display()), err))?;

        let mut written: i64 = 0;
        let mut digest = Context::new();
        let outcome: BackendResult<()> = async {
            while let Some(chunk) = body.next().await {
                check_cancelled(cancel)?;
                let chunk = chunk
                    .map_err(|err| BackendError::io(format!("read body of `{}`", name), err))?;
                written += chunk.len() as i64;
                digest.consume(&chunk);
                file.write_all(&chunk)
                    .await
                    .map_err(|err| BackendError::io(format!("write `{}`", name), err))?;
            }
            if written != size {
                return Err(BackendError::invalid_input(format!(
                    "object `{}` announced {} bytes but the body held {}",
                    name, size, written
                )));
            }
            file.flush()
                .await
                .map_err(|err| BackendError::io(format!("flush `{}`", name), err))?;
            file.sync_all()
                .await
                .map_err(|err| BackendError::io(format!("sync `{}`", name), err))?;
            Ok(())
        }
        .await;
        drop(file);

        if let Err(err) = outcome {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        let final_path = self.object_path(bucket, name);
        let etag = format!("{:x}", digest.compute());
        let committed: BackendResult<()> = async {
            if let Some(parent) = final_path.parent() {
                fs::create_dir_all(parent).await.map_err(|err| {
                    BackendError::io(format!("create {}", parent.display()), err)
                })?;
            }
            // rename keeps the mtime, so the sidecar can be written first
            let modified: DateTime<Utc> = fs::metadata(&tmp_path)
                .await
                .and_then(|meta| meta.modified())
                .map_err(|err| BackendError::io(format!("stat `{}`", name), err))?
                .into();
            let sidecar = Sidecar {
                key: name.to_string(),
                content_type: content_type.to_string(),
                etag: etag.clone(),
                size: written,
                modified,
                metadata: HashMap::new(),
            };
            self.write_sidecar(bucket, name, &sidecar).await?;

            if let Err(err) = rename_over(&tmp_path, &final_path).await {
                let _ = fs::remove_file(self.sidecar_path(bucket, name)).await;
                return Err(BackendError::io(format!("store `{}`", name), err));
            }
            Ok(())
        }
        .await;

        if let Err(err) = committed {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        debug!("stored {} bytes as {}/{}", written, bucket, name);
        Ok(UploadResult {
            bucket: bucket.to_string(),
            name: name.to_string(),
            etag,
            size: written,
        })
    }

    async fn delete_object(
        &self,
        bucket: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<()> {
        check_cancelled(cancel)?;
        Self::ensure_key_safe(name)?;
        self.require_bucket(bucket).await?;

        let file_path = self.object_path(bucket, name);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(BackendError::io(format!("delete `{}`", name), err)),
        }

        let sidecar_path = self.sidecar_path(bucket, name);
        if let Err(err) = fs::remove_file(&sidecar_path).await {
            if err.kind() != ErrorKind::NotFound {
                warn!("cannot remove sidecar {}: {}", sidecar_path.display(), err);
            }
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.data_root(bucket)).await;
        }
        if let Some(parent) = sidecar_path.parent() {
            self.prune_empty_dirs(parent, &self.meta_root(bucket)).await;
        }
        Ok(())
    }

    async fn bucket_exists(&self, bucket: &str, cancel: &CancellationToken) -> BackendResult<bool> {
        check_cancelled(cancel)?;
        match self.require_bucket(bucket).await {
            Ok(()) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn ensure_bucket_exists(
        &self,
        bucket: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<()> {
        if self.bucket_exists(bucket, cancel).await? {
            return Ok(());
        }
        for dir in [
            self.data_root(bucket),
            self.meta_root(bucket),
            self.tmp_root(bucket),
        ] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|err| BackendError::io(format!("create {}", dir.display()), err))?;
        }
        debug!("created local bucket {}", bucket);
        Ok(())
    }

    async fn close(&self) -> BackendResult<()> {
        Ok(())
    }
}

/// Rename, replacing an existing destination on platforms that refuse to.
async fn rename_over(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to).await {
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            fs::remove_file(to).await?;
            fs::rename(from, to).await
        }
        other => other,
    }
}
