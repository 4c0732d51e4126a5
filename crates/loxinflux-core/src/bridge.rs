// ── Bridge ──
//
// Wires the Miniserver session to the pipeline and the delivery channels,
// and supervises them until shutdown or a terminal failure:
//
//   SessionHandle ──records──▶ Pipeline ──batches──▶ DeliveryManager
//        ▲                        │
//   PollScheduler            StructureIndex (reloaded on reconnect)

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use loxinflux_api::{SessionHandle, SessionState};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::delivery::DeliveryManager;
use crate::error::CoreError;
use crate::filter::FilterRuleSet;
use crate::format::MetricFormatter;
use crate::model::{StructureIndex, StructureSource};
use crate::pipeline::{Pipeline, PipelineStats};
use crate::poll::PollScheduler;

/// Time allowed for queued records and batches to drain on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// What ended the supervision loop.
enum Exit {
    Shutdown,
    Session(Result<(), loxinflux_api::Error>),
    Pipeline(Result<PipelineStats, CoreError>),
    DeliveryFailed,
}

pub struct Bridge {
    config: BridgeConfig,
    source: Arc<dyn StructureSource>,
    index: Arc<ArcSwap<StructureIndex>>,
    rules: Arc<FilterRuleSet>,
}

impl Bridge {
    pub fn new(config: BridgeConfig, source: Arc<dyn StructureSource>) -> Self {
        let rules = Arc::new(config.filters.clone());
        Self {
            config,
            source,
            index: Arc::new(ArcSwap::from_pointee(StructureIndex::default())),
            rules,
        }
    }

    /// The live structure index, swapped on every reload.
    pub fn index(&self) -> Arc<ArcSwap<StructureIndex>> {
        Arc::clone(&self.index)
    }

    /// Run with delivery channels built from the configured outputs.
    pub async fn run(self, cancel: CancellationToken) -> Result<PipelineStats, CoreError> {
        // Not a child of `cancel`: channels must outlive the session so
        // queued batches can drain.
        let delivery_cancel = CancellationToken::new();
        let delivery = DeliveryManager::spawn(
            &self.config.outputs,
            self.config.queue_capacity,
            &delivery_cancel,
        )?;
        let result = self.run_with(delivery, cancel).await;
        delivery_cancel.cancel();
        result
    }

    /// Run until `cancel` fires or a component fails terminally.
    ///
    /// Returns the pipeline counters on a clean shutdown.
    pub async fn run_with(
        self,
        delivery: DeliveryManager,
        cancel: CancellationToken,
    ) -> Result<PipelineStats, CoreError> {
        let initial = load_structure(&self.source).await?;
        info!(
            devices = initial.len(),
            version = initial.last_modified().unwrap_or("unknown"),
            "structure snapshot loaded"
        );
        self.index.store(Arc::new(initial));

        let session_config = self.config.session_config()?;
        info!(url = %session_config.base_url, user = %session_config.credentials.user, "connecting to Miniserver");

        let (records_tx, records_rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let session_cancel = cancel.child_token();
        let session = SessionHandle::spawn(session_config, records_tx, session_cancel.clone());

        let tasks_cancel = cancel.child_token();
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        handles.push(tokio::spawn(session_watch_task(
            session.state(),
            Arc::clone(&self.source),
            Arc::clone(&self.index),
            tasks_cancel.clone(),
        )));
        if self.config.poll.enabled {
            let scheduler = PollScheduler::new(
                session.requester(),
                Arc::clone(&self.index),
                Arc::clone(&self.rules),
                self.config.poll.interval,
            );
            handles.push(tokio::spawn(scheduler.run(tasks_cancel.clone())));
            info!(interval_secs = self.config.poll.interval.as_secs(), "poll scheduler started");
        }

        let mut pipeline = Pipeline::new(
            Arc::clone(&self.index),
            Arc::clone(&self.rules),
            MetricFormatter::new(self.config.format),
        );
        let mut drain = Box::pin(pipeline.run(records_rx, &delivery));
        let mut session_done = Box::pin(session.join());

        let exit = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                info!("shutdown requested");
                Exit::Shutdown
            }
            result = &mut session_done => Exit::Session(result),
            result = &mut drain => Exit::Pipeline(result),
            () = delivery.all_failed() => Exit::DeliveryFailed,
        };

        // ── Teardown: stop producers, drain the pipeline, close channels ──
        session_cancel.cancel();
        tasks_cancel.cancel();

        let (session_result, exit) = match exit {
            Exit::Session(result) => (result, None),
            other => (session_done.await, Some(other)),
        };
        let delivery_failed = matches!(exit, Some(Exit::DeliveryFailed));

        let pipeline_result = match exit {
            Some(Exit::Pipeline(result)) => result,
            _ => match tokio::time::timeout(SHUTDOWN_GRACE, &mut drain).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("pipeline did not drain in time");
                    Ok(PipelineStats::default())
                }
            },
        };
        drop(drain);

        for handle in handles {
            let _ = handle.await;
        }
        let delivery_result = delivery.shutdown(SHUTDOWN_GRACE).await;

        if let Err(e) = session_result {
            error!(error = %e, "Miniserver session failed, stopping");
            return Err(CoreError::from(e));
        }
        if delivery_failed || matches!(pipeline_result, Err(CoreError::DeliveryFailed { .. })) {
            let last = delivery_result.err();
            error!(error = ?last, "all delivery channels failed, stopping");
            return Err(CoreError::DeliveryFailed { last });
        }
        let stats = pipeline_result.inspect_err(|e| error!(error = %e, "pipeline failed"))?;
        info!(
            received = stats.received,
            emitted = stats.emitted,
            filtered = stats.filtered,
            unresolved = stats.unresolved,
            "bridge stopped"
        );
        Ok(stats)
    }
}

async fn load_structure(source: &Arc<dyn StructureSource>) -> Result<StructureIndex, CoreError> {
    let source = Arc::clone(source);
    tokio::task::spawn_blocking(move || source.load())
        .await
        .map_err(|e| CoreError::Internal(format!("structure loader panicked: {e}")))?
}

/// Log session transitions and reload the structure after every reconnect.
async fn session_watch_task(
    mut state: watch::Receiver<SessionState>,
    source: Arc<dyn StructureSource>,
    index: Arc<ArcSwap<StructureIndex>>,
    cancel: CancellationToken,
) {
    let mut was_active = false;
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let current = *state.borrow_and_update();
        match current {
            SessionState::Reconnecting { attempt } => warn!(attempt, "Miniserver session reconnecting"),
            SessionState::Failed => error!("Miniserver session failed"),
            other => info!(state = %other, "Miniserver session state changed"),
        }

        if !current.is_active() {
            continue;
        }
        if !was_active {
            was_active = true;
            continue;
        }

        match load_structure(&source).await {
            Ok(fresh) => {
                info!(
                    devices = fresh.len(),
                    version = fresh.last_modified().unwrap_or("unknown"),
                    "structure snapshot reloaded"
                );
                index.store(Arc::new(fresh));
            }
            Err(e) => warn!(error = %e, "structure reload failed, keeping previous snapshot"),
        }
    }
    debug!("session watcher stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::Device;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingSource {
        loads: Arc<AtomicU32>,
    }

    impl StructureSource for CountingSource {
        fn load(&self) -> Result<StructureIndex, CoreError> {
            let n = self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(StructureIndex::new(
                vec![Device::new(format!("D{n}"), "Device", "Switch")],
                Some(n.to_string()),
            ))
        }
    }

    #[tokio::test]
    async fn reloads_structure_only_after_reconnect() {
        let loads = Arc::new(AtomicU32::new(0));
        let source: Arc<dyn StructureSource> = Arc::new(CountingSource {
            loads: Arc::clone(&loads),
        });
        let index = Arc::new(ArcSwap::from_pointee(StructureIndex::default()));
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(session_watch_task(
            state_rx,
            source,
            Arc::clone(&index),
            cancel.clone(),
        ));

        state_tx.send_replace(SessionState::Active);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(loads.load(Ordering::SeqCst), 0);

        state_tx.send_replace(SessionState::Reconnecting { attempt: 1 });
        tokio::time::sleep(Duration::from_millis(50)).await;
        state_tx.send_replace(SessionState::Active);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(index.load().resolve("D0").is_some());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn missing_structure_is_fatal_at_startup() {
        struct Missing;
        impl StructureSource for Missing {
            fn load(&self) -> Result<StructureIndex, CoreError> {
                Err(CoreError::Structure {
                    message: "no snapshot".into(),
                })
            }
        }

        let bridge = Bridge::new(BridgeConfig::default(), Arc::new(Missing));
        let result = bridge
            .run_with(DeliveryManager::new(Vec::new()), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(CoreError::Structure { .. })));
    }
}
