//! ServerCore - main public API for haystack-server

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use haystack::{
    Dict, Dispatcher, DispatcherConfig, Grid, HaystackError, HisItem, HisRange, MemoryBackend,
    Num, Ref, Val, Watch,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::AppError;

/// Dispatcher over the in-memory backend plus change notification
#[derive(Clone)]
pub struct ServerCore {
    dispatcher: Arc<Dispatcher<MemoryBackend>>,
    update_tx: broadcast::Sender<()>,
}

impl ServerCore {
    pub fn new() -> Self {
        Self::with_config(DispatcherConfig::default())
    }

    pub fn with_config(config: DispatcherConfig) -> Self {
        let (update_tx, _) = broadcast::channel(16);
        let backend = Arc::new(MemoryBackend::new());
        Self {
            dispatcher: Arc::new(Dispatcher::with_config(backend, config)),
            update_tx,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<MemoryBackend>> {
        &self.dispatcher
    }

    /// Get a receiver for update notifications
    pub fn subscribe_updates(&self) -> broadcast::Receiver<()> {
        self.update_tx.subscribe()
    }

    fn notify(&self) {
        // no receivers is fine
        let _ = self.update_tx.send(());
    }

    /// Run a dispatcher call on the blocking thread pool
    async fn blocking<T, F>(&self, f: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: FnOnce(&Dispatcher<MemoryBackend>) -> haystack::Result<T> + Send + 'static,
    {
        let dispatcher = self.dispatcher.clone();
        Ok(tokio::task::spawn_blocking(move || f(&*dispatcher)).await??)
    }

    pub fn about(&self) -> Dict {
        self.dispatcher.about()
    }

    pub fn ops(&self) -> Result<Grid, AppError> {
        Ok(self.dispatcher.ops()?)
    }

    pub fn formats(&self) -> Result<Grid, AppError> {
        Ok(self.dispatcher.formats()?)
    }

    /// Insert or replace records, returning their versions.
    ///
    /// A batch with any record lacking an id commits nothing.
    pub async fn commit(&self, records: Vec<Dict>) -> Result<Vec<u64>, AppError> {
        let versions = self
            .blocking(move |d| d.backend().commit_all(records))
            .await?;
        self.notify();
        Ok(versions)
    }

    pub async fn read(&self, ids: Vec<Ref>, checked: bool) -> Result<Grid, AppError> {
        self.blocking(move |d| d.read(&ids, checked)).await
    }

    /// Subscribe ids to an existing watch, or to a new one opened with
    /// `watch_dis` and `lease` when `watch_id` is absent.
    ///
    /// A new watch whose first subscription fails is closed again.
    pub async fn watch_sub(
        &self,
        watch_id: Option<String>,
        watch_dis: Option<String>,
        lease: Option<Num>,
        ids: Vec<Ref>,
        checked: bool,
    ) -> Result<Grid, AppError> {
        self.blocking(move |d| match (watch_id, watch_dis) {
            (Some(id), _) => match d.watch(&id, true)? {
                Some(watch) => watch.sub(&ids, checked),
                None => Err(HaystackError::UnknownWatch(id)),
            },
            (None, Some(dis)) => {
                let watch = d.watch_open(&dis, lease)?;
                let grid = watch.sub(&ids, checked);
                if grid.is_err() {
                    watch.close();
                }
                grid
            }
            (None, None) => Err(HaystackError::InvalidArgument(
                "watchSub needs watchId or watchDis".into(),
            )),
        })
        .await
    }

    pub async fn watch_unsub(
        &self,
        watch_id: String,
        ids: Vec<Ref>,
        close: bool,
    ) -> Result<(), AppError> {
        self.blocking(move |d| d.watch_unsub(&watch_id, &ids, close))
            .await?;
        if close {
            // wake streams so they see the close
            self.notify();
        }
        Ok(())
    }

    pub async fn watch_poll(&self, watch_id: String, refresh: bool) -> Result<Grid, AppError> {
        self.blocking(move |d| d.watch_poll(&watch_id, refresh))
            .await
    }

    pub fn watches(&self) -> Vec<Arc<dyn Watch>> {
        self.dispatcher.watches()
    }

    pub async fn his_read(&self, id: Ref, range: HisRange) -> Result<Grid, AppError> {
        self.blocking(move |d| d.his_read(&id, &range)).await
    }

    pub async fn his_write(&self, id: Ref, items: Vec<HisItem>) -> Result<(), AppError> {
        self.blocking(move |d| d.his_write(&id, &items)).await
    }

    pub async fn point_write(
        &self,
        id: Ref,
        level: u8,
        who: String,
        val: Option<Val>,
        dur: Option<Num>,
    ) -> Result<Grid, AppError> {
        let grid = self
            .blocking(move |d| d.point_write(&id, level, &who, val, dur))
            .await?;
        self.notify();
        Ok(grid)
    }

    pub async fn point_write_array(&self, id: Ref) -> Result<Grid, AppError> {
        self.blocking(move |d| d.point_write_array(&id)).await
    }

    pub async fn invoke_action(
        &self,
        id: Ref,
        action: String,
        args: Dict,
        mime_type: Option<String>,
    ) -> Result<Grid, AppError> {
        self.blocking(move |d| d.invoke_action(&id, &action, &args, mime_type.as_deref()))
            .await
    }

    /// Close watches whose lease elapsed; returns how many
    pub fn expire_watches(&self) -> usize {
        let expired = self.dispatcher.expire_watches(Instant::now());
        if expired > 0 {
            self.notify();
        }
        expired
    }

    /// Release timed point writes that lapsed; returns how many points changed
    pub fn expire_writes(&self) -> usize {
        let released = self.dispatcher.backend().expire_writes(Utc::now());
        if released > 0 {
            self.notify();
        }
        released
    }

    /// Spawn a task that expires watch leases and timed writes every `interval`
    pub fn spawn_lease_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let core = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let sweep = core.clone();
                let swept = tokio::task::spawn_blocking(move || {
                    (sweep.expire_watches(), sweep.expire_writes())
                })
                .await;
                match swept {
                    Ok((0, 0)) => {}
                    Ok((watches, writes)) => log::info!(
                        "Lease sweep closed {} watch(es), released {} write(s)",
                        watches,
                        writes
                    ),
                    Err(e) => log::warn!("Lease sweep failed: {}", e),
                }
            }
        })
    }
}

impl Default for ServerCore {
    fn default() -> Self {
        Self::new()
    }
}
