use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

use crate::error::BackendError;
use crate::traits::BackingStore;

const EXTENSION: &str = "json";
const TMP_EXTENSION: &str = "tmp";

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Directory-backed store: one JSON document per key.
///
/// Keys are escaped into file names so that any string can be used as a key. Writes go to a temporary file first and
/// are renamed into place, which keeps each key's content whole even if the process dies mid-write.
///
/// The directory may be shared with other files. Only documents and temporary files whose names this store produces
/// are listed, swept or cleared; anything else is left alone.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub async fn open<P: AsRef<Path>>(root: P) -> Result<Self, BackendError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        let store = Self { root };

        // Leftovers of writes interrupted by a crash or a cancelled task.
        let mut swept = 0;
        for (path, file) in store.owned_files().await? {
            if file == StoreFile::Partial && remove_file(&path).await? {
                swept += 1;
            }
        }
        debug!(root = %store.root.display(), swept, "opened file store");
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.{EXTENSION}", encode_key(key)))
    }

    async fn owned_files(&self) -> Result<Vec<(PathBuf, StoreFile)>, BackendError> {
        let mut dir = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|err| BackendError::Unavailable(format!("{}: {err}", self.root.display())))?;
        let mut files = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if let Some(file) = classify(&path) {
                files.push((path, file));
            }
        }
        Ok(files)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StoreFile {
    Document(String),
    Partial,
}

/// Tell the store's own files apart from foreign ones. A name belongs to the store only if it is exactly what
/// `encode_key` would produce for some key.
fn classify(path: &Path) -> Option<StoreFile> {
    let stem = path.file_stem()?.to_str()?;
    match path.extension()?.to_str()? {
        EXTENSION => match decode_key(stem).filter(|key| encode_key(key) == stem) {
            Some(key) => Some(StoreFile::Document(key)),
            None => {
                warn!(path = %path.display(), "file name is not an encoded key, ignoring");
                None
            }
        },
        TMP_EXTENSION => {
            let (encoded, seq) = stem.rsplit_once('.')?;
            seq.parse::<u64>().ok()?;
            let key = decode_key(encoded)?;
            (encode_key(&key) == encoded).then_some(StoreFile::Partial)
        }
        _ => None,
    }
}

async fn remove_file(path: &Path) -> Result<bool, BackendError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for (i, byte) in key.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' || (byte == b'.' && i > 0);
        if keep {
            encoded.push(byte as char);
        }
        else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        }
        else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(decoded).ok()
}

#[async_trait]
impl BackingStore for FsStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, BackendError> {
        let content = match tokio::fs::read(self.path_of(key)).await {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|err| BackendError::Corrupted(format!("'{key}': {err}")))
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), BackendError> {
        let path = self.path_of(key);
        // Unique per write: the same key may be written by a flush and an ingestion batch at once.
        let tmp = path.with_extension(format!(
            "{}.{TMP_EXTENSION}",
            TMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        tokio::fs::write(&tmp, serde_json::to_vec(&value)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, BackendError> {
        Ok(self
            .owned_files()
            .await?
            .into_iter()
            .filter_map(|(_, file)| match file {
                StoreFile::Document(key) => Some(key),
                StoreFile::Partial => None,
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        remove_file(&self.path_of(key)).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), BackendError> {
        tokio::fs::create_dir_all(&self.root).await?;
        for (path, _) in self.owned_files().await? {
            remove_file(&path).await?;
        }
        Ok(())
    }
}
