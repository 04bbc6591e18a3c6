//! Resource watch adapter
//!
//! List+watch subscriptions for claims, volumes and classes backed by
//! kube-runtime reflectors. Every subscription feeds its own dispatch loop;
//! a resync ticker periodically replays the cached claims and volumes so
//! missed or failed work is re-evaluated.
//!
//! Watch events are delivered at least once and possibly out of order; the
//! handlers tolerate both.

use crate::controller::ProvisionController;
use crate::error::Result;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::Api;
use kube::runtime::reflector::{reflector, store::Writer, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Handlers
// =============================================================================

/// Receives the events of one resource kind
#[async_trait]
pub trait ResourceEventHandler<K: Send + Sync + 'static>: Send + Sync {
    /// Object added, updated or replayed by a resync
    async fn applied(&self, obj: Arc<K>);

    /// Object removed from the cluster
    async fn deleted(&self, _obj: Arc<K>) {}
}

#[async_trait]
impl ResourceEventHandler<PersistentVolumeClaim> for Arc<ProvisionController> {
    async fn applied(&self, claim: Arc<PersistentVolumeClaim>) {
        self.on_claim(claim);
    }

    async fn deleted(&self, claim: Arc<PersistentVolumeClaim>) {
        self.on_deleted("PersistentVolumeClaim", &claim.name_any());
    }
}

#[async_trait]
impl ResourceEventHandler<PersistentVolume> for Arc<ProvisionController> {
    async fn applied(&self, volume: Arc<PersistentVolume>) {
        self.on_volume(volume);
    }

    async fn deleted(&self, volume: Arc<PersistentVolume>) {
        self.on_deleted("PersistentVolume", &volume.name_any());
    }
}

/// Classes only feed the cache
struct ClassEvents;

#[async_trait]
impl ResourceEventHandler<StorageClass> for ClassEvents {
    async fn applied(&self, class: Arc<StorageClass>) {
        debug!(class = %class.name_any(), provisioner = %class.provisioner, "storage class cached");
    }
}

// =============================================================================
// Watch Adapter
// =============================================================================

/// Owns the reflectors for claims, volumes and classes
pub struct WatchAdapter {
    client: Client,
    resync_period: Duration,
    class_writer: Writer<StorageClass>,
    class_store: Store<StorageClass>,
    synced: watch::Sender<bool>,
}

impl WatchAdapter {
    pub fn new(client: Client, resync_period: Duration) -> Self {
        let class_writer = Writer::<StorageClass>::default();
        let class_store = class_writer.as_reader();
        Self {
            client,
            resync_period,
            class_writer,
            class_store,
            synced: watch::channel(false).0,
        }
    }

    /// Flips to true once the class cache holds its initial list
    pub fn synced(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }

    /// Local StorageClass cache, filled once [`WatchAdapter::run`] starts
    pub fn class_cache(&self) -> Store<StorageClass> {
        self.class_store.clone()
    }

    /// Watch until `shutdown` is cancelled
    pub async fn run(
        self,
        controller: Arc<ProvisionController>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        info!(
            resync_secs = self.resync_period.as_secs(),
            "starting claim, volume and class watches"
        );

        let class_stream = reflector(
            self.class_writer,
            watcher(Api::<StorageClass>::all(self.client.clone()), watcher::Config::default()),
        )
        .default_backoff();

        let claim_writer = Writer::<PersistentVolumeClaim>::default();
        let claim_store = claim_writer.as_reader();
        let claim_stream = reflector(
            claim_writer,
            watcher(
                Api::<PersistentVolumeClaim>::all(self.client.clone()),
                watcher::Config::default(),
            ),
        )
        .default_backoff();

        let volume_writer = Writer::<PersistentVolume>::default();
        let volume_store = volume_writer.as_reader();
        let volume_stream = reflector(
            volume_writer,
            watcher(
                Api::<PersistentVolume>::all(self.client.clone()),
                watcher::Config::default(),
            ),
        )
        .default_backoff();

        // Claims are judged against the class cache, so they wait for its
        // initial list
        let classes_synced_rx = self.synced.subscribe();

        let classes = dispatch(
            "StorageClass",
            class_stream,
            ClassEvents,
            Some(self.synced),
            shutdown.clone(),
        );
        let claims = async {
            if wait_for_sync(classes_synced_rx, &shutdown).await {
                dispatch(
                    "PersistentVolumeClaim",
                    claim_stream,
                    controller.clone(),
                    None,
                    shutdown.clone(),
                )
                .await;
            }
        };
        let volumes = dispatch(
            "PersistentVolume",
            volume_stream,
            controller.clone(),
            None,
            shutdown.clone(),
        );
        let claim_resync = resync(
            "PersistentVolumeClaim",
            move || claim_store.state(),
            controller.clone(),
            self.resync_period,
            shutdown.clone(),
        );
        let volume_resync = resync(
            "PersistentVolume",
            move || volume_store.state(),
            controller.clone(),
            self.resync_period,
            shutdown.clone(),
        );

        tokio::join!(classes, claims, volumes, claim_resync, volume_resync);
        info!("watches stopped");
        Ok(())
    }
}

/// Wait for the class cache; false if shutdown came first
async fn wait_for_sync(mut synced: watch::Receiver<bool>, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        res = synced.wait_for(|done| *done) => res.is_ok(),
    }
}

/// Feed one watch stream to its handler until shutdown or stream end
pub async fn dispatch<K, S, H>(
    kind: &'static str,
    stream: S,
    handler: H,
    synced: Option<watch::Sender<bool>>,
    shutdown: CancellationToken,
) where
    K: Send + Sync + 'static,
    S: Stream<Item = std::result::Result<watcher::Event<K>, watcher::Error>>,
    H: ResourceEventHandler<K>,
{
    let mut stream = std::pin::pin!(stream);
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(watcher::Event::Applied(obj))) => handler.applied(Arc::new(obj)).await,
            Some(Ok(watcher::Event::Deleted(obj))) => handler.deleted(Arc::new(obj)).await,
            Some(Ok(watcher::Event::Restarted(objs))) => {
                debug!(kind, count = objs.len(), "watch (re)listed");
                for obj in objs {
                    handler.applied(Arc::new(obj)).await;
                }
                if let Some(synced) = &synced {
                    synced.send_replace(true);
                }
            }
            Some(Err(e)) => warn!(kind, "watch error: {}", e),
            None => {
                warn!(kind, "watch stream ended");
                break;
            }
        }
    }
    debug!(kind, "dispatch stopped");
}

/// Replay a cache snapshot through the handler every `period`
pub async fn resync<K, F, H>(
    kind: &'static str,
    snapshot: F,
    handler: H,
    period: Duration,
    shutdown: CancellationToken,
) where
    K: Send + Sync + 'static,
    F: Fn() -> Vec<Arc<K>>,
    H: ResourceEventHandler<K>,
{
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let objs = snapshot();
        debug!(kind, count = objs.len(), "resync");
        for obj in objs {
            handler.applied(obj).await;
        }
    }
}
