//! Chunked upload ingestion.
//!
//! Each upload is one session scoped to the connection that started it.
//! Sessions write to their own file handle behind their own mutex, so slow
//! disk writes never touch room or registry locks. Any abnormal end of a
//! session (overflow, write error, owner disconnect) deletes the partial
//! file; only `finish` leaves bytes on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use huddle_shared::constants::UPLOADS_URL_PREFIX;
use huddle_shared::protocol::FileMeta;
use huddle_shared::types::{ConnectionId, RoomCode, UploadId};

#[derive(Debug, Error)]
pub enum UploadError {
    /// Session does not exist, or exists but belongs to another connection.
    /// Both cases look identical to the caller.
    #[error("Unknown upload session")]
    UnknownUpload,

    #[error("Upload already completed")]
    Closed,

    #[error("Empty chunk")]
    EmptyChunk,

    #[error("Declared size must be a positive integer")]
    InvalidSize,

    #[error("Upload exceeds the maximum allowed size")]
    FileExceeded,

    #[error("Failed to write upload data: {0}")]
    WriteFailed(String),
}

impl UploadError {
    /// Stable token carried in negative acks.
    pub fn code(&self) -> &'static str {
        match self {
            UploadError::UnknownUpload => "UnknownUpload",
            UploadError::Closed => "Closed",
            UploadError::EmptyChunk => "EmptyChunk",
            UploadError::InvalidSize => "InvalidSize",
            UploadError::FileExceeded => "FileExceeded",
            UploadError::WriteFailed(_) => "WriteFailed",
        }
    }
}

struct UploadSession {
    owner: ConnectionId,
    #[allow(dead_code)]
    room: RoomCode,
    original_name: String,
    mime_type: String,
    declared_size: u64,
    received: u64,
    stored_name: String,
    path: PathBuf,
    file: Option<File>,
    closed: bool,
}

impl UploadSession {
    /// Drop the write handle and refuse further chunks. Does not touch the
    /// map entry or the file on disk; callers handle both.
    fn discard(&mut self) {
        self.file = None;
        self.closed = true;
    }
}

struct SessionHandle {
    owner: ConnectionId,
    inner: Arc<Mutex<UploadSession>>,
}

pub struct UploadStore {
    dir: PathBuf,
    max_size: u64,
    sessions: RwLock<HashMap<UploadId, SessionHandle>>,
}

impl UploadStore {
    pub async fn new(dir: PathBuf, max_size: u64) -> std::io::Result<Self> {
        fs::create_dir_all(&dir).await?;
        info!(path = %dir.display(), "Upload store initialized");
        Ok(Self {
            dir,
            max_size,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Open a new session: validate the declared size, derive a safe storage
    /// filename, create the file, and register the session under a fresh id.
    pub async fn begin(
        &self,
        owner: ConnectionId,
        room: RoomCode,
        original_name: &str,
        mime_type: &str,
        declared_size: i64,
    ) -> Result<UploadId, UploadError> {
        if declared_size <= 0 {
            return Err(UploadError::InvalidSize);
        }
        let declared_size = declared_size as u64;
        if declared_size > self.max_size {
            return Err(UploadError::FileExceeded);
        }

        let stored_name = storage_name(original_name);
        let path = self.dir.join(&stored_name);
        let file = File::create(&path)
            .await
            .map_err(|e| UploadError::WriteFailed(e.to_string()))?;

        let id = UploadId::new();
        let session = UploadSession {
            owner,
            room: room.clone(),
            original_name: original_name.to_string(),
            mime_type: mime_type.to_string(),
            declared_size,
            received: 0,
            stored_name,
            path,
            file: Some(file),
            closed: false,
        };

        self.sessions.write().await.insert(
            id,
            SessionHandle {
                owner,
                inner: Arc::new(Mutex::new(session)),
            },
        );

        info!(
            upload = %id,
            peer = %owner,
            room = %room,
            declared = declared_size,
            "Upload started"
        );
        Ok(id)
    }

    /// Append one chunk and return the cumulative byte count. Overflowing the
    /// declared size (or the hard cap) aborts the session and deletes the
    /// partial file.
    pub async fn append(
        &self,
        owner: ConnectionId,
        id: UploadId,
        chunk: &[u8],
    ) -> Result<u64, UploadError> {
        if chunk.is_empty() {
            return Err(UploadError::EmptyChunk);
        }

        let handle = self.session(owner, id).await?;
        let mut session = handle.lock().await;
        if session.closed {
            return Err(UploadError::Closed);
        }
        let Some(file) = session.file.as_mut() else {
            return Err(UploadError::Closed);
        };

        if let Err(e) = file.write_all(chunk).await {
            warn!(upload = %id, error = %e, "Chunk write failed, aborting upload");
            let path = session.path.clone();
            session.discard();
            drop(session);
            self.remove_and_delete(id, &path).await;
            return Err(UploadError::WriteFailed(e.to_string()));
        }

        session.received += chunk.len() as u64;
        if session.received > session.declared_size || session.received > self.max_size {
            debug!(
                upload = %id,
                received = session.received,
                declared = session.declared_size,
                "Upload overflowed declared size"
            );
            let path = session.path.clone();
            session.discard();
            drop(session);
            self.remove_and_delete(id, &path).await;
            return Err(UploadError::FileExceeded);
        }

        Ok(session.received)
    }

    /// Close the session and return the file metadata. The received byte
    /// count is accepted as-is; the declared size was only ever an upper
    /// bound.
    pub async fn finish(
        &self,
        owner: ConnectionId,
        id: UploadId,
    ) -> Result<FileMeta, UploadError> {
        let handle = self.session(owner, id).await?;
        let mut session = handle.lock().await;
        if session.closed {
            return Err(UploadError::Closed);
        }
        session.closed = true;

        if let Some(mut file) = session.file.take() {
            if let Err(e) = file.flush().await {
                warn!(upload = %id, error = %e, "Flush failed, discarding upload");
                let path = session.path.clone();
                drop(file);
                drop(session);
                self.remove_and_delete(id, &path).await;
                return Err(UploadError::WriteFailed(e.to_string()));
            }
        }

        let meta = FileMeta {
            id: Uuid::new_v4(),
            url: format!("{}/{}", UPLOADS_URL_PREFIX, session.stored_name),
            original_name: session.original_name.clone(),
            mime_type: session.mime_type.clone(),
            size: session.received,
            uploaded_at: Utc::now(),
        };

        info!(
            upload = %id,
            peer = %owner,
            size = meta.size,
            url = %meta.url,
            "Upload completed"
        );

        drop(session);
        self.sessions.write().await.remove(&id);
        Ok(meta)
    }

    /// Abort every session owned by a departing connection and delete the
    /// partial files. Returns how many sessions were torn down.
    pub async fn abort_all_for(&self, owner: ConnectionId) -> usize {
        let doomed: Vec<(UploadId, Arc<Mutex<UploadSession>>)> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<UploadId> = sessions
                .iter()
                .filter(|(_, handle)| handle.owner == owner)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|handle| (id, handle.inner)))
                .collect()
        };

        let count = doomed.len();
        for (id, session) in doomed {
            let mut session = session.lock().await;
            let path = session.path.clone();
            session.discard();
            drop(session);
            if let Err(e) = fs::remove_file(&path).await {
                debug!(upload = %id, error = %e, "Partial file already gone");
            }
            info!(upload = %id, peer = %owner, "Aborted upload on disconnect");
        }
        count
    }

    async fn session(
        &self,
        owner: ConnectionId,
        id: UploadId,
    ) -> Result<Arc<Mutex<UploadSession>>, UploadError> {
        let sessions = self.sessions.read().await;
        let handle = sessions.get(&id).ok_or(UploadError::UnknownUpload)?;
        // An upload belongs to its originating connection; anyone else gets
        // the same answer as for a session that never existed.
        if handle.owner != owner {
            return Err(UploadError::UnknownUpload);
        }
        Ok(Arc::clone(&handle.inner))
    }

    async fn remove_and_delete(&self, id: UploadId, path: &Path) {
        self.sessions.write().await.remove(&id);
        if let Err(e) = fs::remove_file(path).await {
            warn!(upload = %id, path = %path.display(), error = %e, "Failed to delete partial file");
        }
    }
}

/// Derive the on-disk name: sanitized basename, millisecond timestamp, and a
/// random decimal suffix, keeping a plausible extension if there is one. The
/// client-supplied name is never used as a path component.
fn storage_name(original: &str) -> String {
    let base = sanitize_basename(original);
    let (stem, ext) = split_extension(&base);
    let millis = Utc::now().timestamp_millis();
    let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000_000);
    match ext {
        Some(ext) => format!("{stem}-{millis}-{suffix}.{ext}"),
        None => format!("{stem}-{millis}-{suffix}"),
    }
}

fn sanitize_basename(name: &str) -> String {
    // Strip any directory component (either separator flavor), leading dots,
    // and control characters.
    let tail = name.rsplit(['/', '\\']).next().unwrap_or(name).trim();
    let tail = tail.trim_start_matches('.');
    let cleaned: String = tail.chars().filter(|c| !c.is_control()).take(80).collect();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

fn split_extension(base: &str) -> (&str, Option<&str>) {
    match base.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= 10
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            (stem, Some(ext))
        }
        _ => (base, None),
    }
}
