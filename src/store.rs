//! Blob storage boundary. A store maps keys to byte blobs and tells a
//! missing key (`Ok(None)`) apart from a failed request (`Err`).

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use thiserror::Error;
use tracing::debug;
use url::Url;

const MAX_BLOB_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Debug, Error)]
pub(crate) enum StoreError {
    #[error("I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },
    #[error("HTTP {status} for {key}")]
    Status { key: String, status: u16 },
    #[error("transport error for {key}: {message}")]
    Transport { key: String, message: String },
    #[error("invalid store location: {0}")]
    Location(String),
}

pub(crate) trait RemoteStore: Send + Sync {
    fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn store(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;
}

impl<T: RemoteStore + ?Sized> RemoteStore for Box<T> {
    fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).fetch(key)
    }

    fn store(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        (**self).store(key, bytes)
    }
}

impl<T: RemoteStore + ?Sized> RemoteStore for Arc<T> {
    fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).fetch(key)
    }

    fn store(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        (**self).store(key, bytes)
    }
}

/// A local directory standing in for a bucket.
#[derive(Debug, Clone)]
pub(crate) struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub(crate) fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(key);
        let escapes = relative.components().any(|c| {
            !matches!(c, std::path::Component::Normal(_))
        });
        if key.trim().is_empty() || escapes {
            return Err(StoreError::Location(format!("key {key:?} is not a plain relative path")));
        }
        Ok(self.root.join(relative))
    }
}

impl RemoteStore for FsStore {
    fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    fn store(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let io_err = |source| StoreError::Io {
            key: key.to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("blob");
        let tmp = path.with_file_name(format!(".{file_name}.tmp"));
        fs::write(&tmp, bytes).map_err(io_err)?;
        fs::rename(&tmp, &path).map_err(io_err)?;
        debug!(key, bytes = bytes.len(), "stored blob on disk");
        Ok(())
    }
}

/// Plain HTTP object endpoint: `GET`/`PUT {bucket_url}/{key}`.
pub(crate) struct HttpStore {
    agent: ureq::Agent,
    bucket_url: Url,
    authorization: Option<String>,
}

impl HttpStore {
    /// `auth` is either `user:password` (sent as Basic) or a bare token (sent
    /// as Bearer).
    pub(crate) fn new(bucket_url: &str, auth: Option<&str>, timeout: Duration) -> Result<Self, StoreError> {
        let mut bucket_url = Url::parse(bucket_url)
            .map_err(|err| StoreError::Location(format!("{bucket_url}: {err}")))?;
        if !bucket_url.path().ends_with('/') {
            let path = format!("{}/", bucket_url.path());
            bucket_url.set_path(&path);
        }
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();
        let authorization = auth.map(|auth| {
            if auth.contains(':') {
                let encoded = base64::engine::general_purpose::STANDARD.encode(auth.as_bytes());
                format!("Basic {encoded}")
            } else {
                format!("Bearer {auth}")
            }
        });
        Ok(Self {
            agent,
            bucket_url,
            authorization,
        })
    }

    pub(crate) fn object_url(&self, key: &str) -> Result<Url, StoreError> {
        let encoded = key
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        if encoded.is_empty() {
            return Err(StoreError::Location(format!("empty key {key:?}")));
        }
        self.bucket_url
            .join(&encoded)
            .map_err(|err| StoreError::Location(format!("{key}: {err}")))
    }

    fn request(&self, method: &str, url: &Url) -> ureq::Request {
        let request = self.agent.request(method, url.as_str());
        match &self.authorization {
            Some(value) => request.set("Authorization", value),
            None => request,
        }
    }
}

fn map_ureq_error(key: &str, err: ureq::Error) -> StoreError {
    match err {
        ureq::Error::Status(status, _) => StoreError::Status {
            key: key.to_string(),
            status,
        },
        ureq::Error::Transport(transport) => StoreError::Transport {
            key: key.to_string(),
            message: transport.to_string(),
        },
    }
}

impl RemoteStore for HttpStore {
    fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let url = self.object_url(key)?;
        let response = match self.request("GET", &url).call() {
            Ok(resp) => resp,
            Err(ureq::Error::Status(404, _)) => return Ok(None),
            Err(err) => return Err(map_ureq_error(key, err)),
        };
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_BLOB_BYTES)
            .read_to_end(&mut bytes)
            .map_err(|source| StoreError::Io {
                key: key.to_string(),
                source,
            })?;
        debug!(key, bytes = bytes.len(), "fetched blob over HTTP");
        Ok(Some(bytes))
    }

    fn store(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let url = self.object_url(key)?;
        self.request("PUT", &url)
            .set("content-type", "application/json")
            .send_bytes(bytes)
            .map_err(|err| map_ureq_error(key, err))?;
        debug!(key, bytes = bytes.len(), "stored blob over HTTP");
        Ok(())
    }
}

/// `http(s)://` locations become an [`HttpStore`]; anything else (a plain
/// path or `file://` URL) is a directory.
pub(crate) fn open_store(
    location: &str,
    auth: Option<&str>,
    timeout: Duration,
) -> Result<Box<dyn RemoteStore>, StoreError> {
    let location = location.trim();
    if location.starts_with("http://") || location.starts_with("https://") {
        return Ok(Box::new(HttpStore::new(location, auth, timeout)?));
    }
    let path = match location.strip_prefix("file://") {
        Some(rest) => rest,
        None => location,
    };
    if path.is_empty() {
        return Err(StoreError::Location("empty store location".to_string()));
    }
    Ok(Box::new(FsStore::new(path)))
}

#[cfg(test)]
pub(crate) use memory::MemoryStore;

#[cfg(test)]
mod memory {
    use std::collections::{HashMap, HashSet};
    use std::io;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::{RemoteStore, StoreError};

    /// In-memory store with switchable failures.
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        blobs: Mutex<HashMap<String, Vec<u8>>>,
        failing_puts: Mutex<HashSet<String>>,
        fail_gets: AtomicBool,
        puts: AtomicUsize,
    }

    impl MemoryStore {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn insert(&self, key: &str, bytes: &[u8]) {
            self.blobs.lock().unwrap().insert(key.to_string(), bytes.to_vec());
        }

        pub(crate) fn get(&self, key: &str) -> Option<Vec<u8>> {
            self.blobs.lock().unwrap().get(key).cloned()
        }

        pub(crate) fn fail_puts_to(&self, key: &str, fail: bool) {
            let mut failing = self.failing_puts.lock().unwrap();
            if fail {
                failing.insert(key.to_string());
            } else {
                failing.remove(key);
            }
        }

        pub(crate) fn fail_gets(&self, fail: bool) {
            self.fail_gets.store(fail, Ordering::SeqCst);
        }

        pub(crate) fn put_count(&self) -> usize {
            self.puts.load(Ordering::SeqCst)
        }
    }

    fn injected(key: &str) -> StoreError {
        StoreError::Io {
            key: key.to_string(),
            source: io::Error::new(io::ErrorKind::TimedOut, "injected failure"),
        }
    }

    impl RemoteStore for MemoryStore {
        fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            if self.fail_gets.load(Ordering::SeqCst) {
                return Err(injected(key));
            }
            Ok(self.get(key))
        }

        fn store(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
            if self.failing_puts.lock().unwrap().contains(key) {
                return Err(injected(key));
            }
            self.puts.fetch_add(1, Ordering::SeqCst);
            self.insert(key, bytes);
            Ok(())
        }
    }
}
