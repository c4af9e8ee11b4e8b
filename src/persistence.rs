//! Local persistence: a debouncing writer actor and a JSON file cache.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use actix::prelude::*;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::schemas::CacheSnapshot;
use crate::stores::LocalCache;

/// Queue a snapshot; only the newest one survives the quiet period.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Persist(pub CacheSnapshot);

/// Write any queued snapshot now.
#[derive(Message)]
#[rtype(result = "Result<(), SyncError>")]
pub struct Flush;

/// Drop any queued snapshot without writing it.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Discard;

/// Coalesces bursts of [`Persist`] messages into one cache write.
pub struct CacheWriter {
    cache: Arc<dyn LocalCache>,
    delay: Duration,
    pending: Option<CacheSnapshot>,
    timer: Option<SpawnHandle>,
}

impl CacheWriter {
    pub fn new(cache: Arc<dyn LocalCache>, delay: Duration) -> Self {
        Self {
            cache,
            delay,
            pending: None,
            timer: None,
        }
    }

    fn cancel_timer(&mut self, ctx: &mut Context<Self>) {
        if let Some(handle) = self.timer.take() {
            ctx.cancel_future(handle);
        }
    }

    fn write_pending(&mut self, ctx: &mut Context<Self>) {
        self.timer = None;
        let Some(snapshot) = self.pending.take() else {
            return;
        };
        let cache = Arc::clone(&self.cache);
        ctx.spawn(
            async move { cache.save(&snapshot).await }
                .into_actor(self)
                .map(|result, _, _| match result {
                    Ok(()) => debug!("persisted cache snapshot"),
                    Err(err) => warn!(error = %err, "failed to persist cache snapshot"),
                }),
        );
    }
}

impl Actor for CacheWriter {
    type Context = Context<Self>;

    fn stopping(&mut self, ctx: &mut Self::Context) -> Running {
        if self.pending.is_some() {
            warn!("cache writer stopping with an unwritten snapshot");
        }
        self.cancel_timer(ctx);
        Running::Stop
    }
}

impl Handler<Persist> for CacheWriter {
    type Result = ();

    fn handle(&mut self, msg: Persist, ctx: &mut Self::Context) {
        self.pending = Some(msg.0);
        self.cancel_timer(ctx);
        self.timer = Some(ctx.run_later(self.delay, |writer, ctx| writer.write_pending(ctx)));
    }
}

impl Handler<Flush> for CacheWriter {
    type Result = ResponseFuture<Result<(), SyncError>>;

    fn handle(&mut self, _: Flush, ctx: &mut Self::Context) -> Self::Result {
        self.cancel_timer(ctx);
        let pending = self.pending.take();
        let cache = Arc::clone(&self.cache);
        Box::pin(async move {
            match pending {
                Some(snapshot) => cache.save(&snapshot).await,
                None => Ok(()),
            }
        })
    }
}

impl Handler<Discard> for CacheWriter {
    type Result = ();

    fn handle(&mut self, _: Discard, ctx: &mut Self::Context) {
        self.cancel_timer(ctx);
        self.pending = None;
    }
}

impl From<MailboxError> for SyncError {
    fn from(err: MailboxError) -> Self {
        SyncError::underlying(err)
    }
}

/// One JSON document per account under a cache directory.
pub struct FileCache {
    path: PathBuf,
}

impl FileCache {
    /// One file per account, named by the hex of the account id so distinct ids never share it.
    pub fn new(dir: impl AsRef<Path>, account_id: &str) -> Self {
        let file_name = hex::encode(account_id.as_bytes());
        Self {
            path: dir.as_ref().join(format!("{file_name}.json")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LocalCache for FileCache {
    async fn load(&self) -> Result<CacheSnapshot, SyncError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(CacheSnapshot::default()),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_str(&raw) {
            Ok(snapshot) => Ok(snapshot),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "ignoring unreadable cache");
                Ok(CacheSnapshot::default())
            }
        }
    }

    async fn save(&self, snapshot: &CacheSnapshot) -> Result<(), SyncError> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let body = serde_json::to_vec(snapshot)?;
        let staging = self.path.with_extension("json.tmp");
        tokio::fs::write(&staging, body).await?;
        tokio::fs::rename(&staging, &self.path).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), SyncError> {
        match tokio::fs::remove_file(&self.path).await {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}
