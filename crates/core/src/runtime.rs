use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::Result;
use crate::catalog::BackupCatalog;
use crate::engine::{Command, Intent, ListEngine, ListView};
use crate::index::{BackupEntry, SelectionType, SubjectKind};
use crate::scan::{BatchExecutor, Scanner};

/// Everything a spawned engine needs. The catalog is shared between kinds;
/// scanner and executor are per-kind collaborators.
pub struct EngineDeps {
    pub kind: SubjectKind,
    pub catalog: Arc<BackupCatalog>,
    pub scanner: Arc<dyn Scanner>,
    pub executor: Arc<dyn BatchExecutor>,
    pub accounts: Vec<String>,
}

type Snapshot = (Vec<BackupEntry>, Vec<u32>);

enum Msg {
    Intent(Intent),
    AccountsChanged(Vec<String>),
    Query(oneshot::Sender<ListView>),
    RefreshDone {
        task_id: Uuid,
        outcome: std::result::Result<Snapshot, String>,
        notice: Option<String>,
    },
    BatchDone {
        task_id: Uuid,
        error: Option<String>,
    },
}

pub struct EngineHandle {
    tx: mpsc::Sender<Msg>,
    views: broadcast::Sender<ListView>,
    latest: Arc<Mutex<ListView>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl EngineHandle {
    pub async fn send(&self, intent: Intent) {
        let _ = self.tx.send(Msg::Intent(intent)).await;
    }

    pub async fn set_accounts(&self, accounts: Vec<String>) {
        let _ = self.tx.send(Msg::AccountsChanged(accounts)).await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ListView> {
        self.views.subscribe()
    }

    /// Last published view, without waiting for queued messages.
    pub fn latest(&self) -> ListView {
        self.latest.lock().expect("view mutex poisoned").clone()
    }

    /// Round-trips through the owner task: the returned view reflects every
    /// message sent before this call.
    pub async fn query(&self) -> ListView {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Msg::Query(reply_tx)).await.is_err() {
            return self.latest();
        }
        reply_rx.await.unwrap_or_else(|_| self.latest())
    }

    /// Requests a refresh (coalesced if one is in flight) and waits for the
    /// engine to settle.
    pub async fn refresh_and_wait(&self) -> ListView {
        let rx = self.subscribe();
        self.send(Intent::OnRefresh).await;
        self.settle(rx).await
    }

    /// Emits the delete round for the current selection and waits for the
    /// trailing rescan.
    pub async fn delete_and_wait(&self) -> ListView {
        let rx = self.subscribe();
        self.send(Intent::DeleteSelected).await;
        self.settle(rx).await
    }

    pub async fn process_and_wait(&self, selection: SelectionType) -> ListView {
        let rx = self.subscribe();
        self.send(Intent::Process(selection)).await;
        self.settle(rx).await
    }

    /// Waits until the engine is quiet. Each check is a `query` round-trip
    /// (so it sees every message sent before the wait began); the
    /// subscription, taken before the triggering intent was sent, only wakes
    /// the loop, which makes a missed-publish race impossible.
    async fn settle(&self, mut rx: broadcast::Receiver<ListView>) -> ListView {
        loop {
            let view = self.query().await;
            if !view.refreshing && !view.processing {
                return view;
            }
            match rx.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return self.latest(),
            }
        }
    }

    pub async fn shutdown(self) {
        let mut this = self;
        if let Some(tx) = this.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = this.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Spawns the owner task for one subject kind. The engine state is touched
/// only inside that task; intents and completions are applied in arrival
/// order. The initial view is seeded from the catalog so callers see the
/// last scan's population before any refresh runs.
pub async fn spawn_engine(deps: EngineDeps) -> EngineHandle {
    let EngineDeps {
        kind,
        catalog,
        scanner,
        executor,
        accounts,
    } = deps;

    let mut engine = ListEngine::new(kind);
    engine.set_accounts(accounts);
    match load_snapshot(&catalog, kind).await {
        Ok((entries, users)) => engine.install_snapshot(entries, users, None),
        Err(e) => engine.refresh_failed(format!("catalog read failed: {e}")),
    }

    let (tx, mut rx) = mpsc::channel::<Msg>(64);
    let (views, _) = broadcast::channel::<ListView>(64);
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let latest = Arc::new(Mutex::new(engine.view().clone()));

    let worker_tx = tx.clone();
    let views_tx = views.clone();
    let latest_state = latest.clone();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    match msg {
                        Msg::Intent(intent) => {
                            let applied = engine.apply(intent);
                            for command in applied.commands {
                                dispatch(
                                    command,
                                    kind,
                                    catalog.clone(),
                                    scanner.clone(),
                                    executor.clone(),
                                    worker_tx.clone(),
                                );
                            }
                            if applied.changed {
                                publish(&engine, &views_tx, &latest_state);
                            }
                        }
                        Msg::AccountsChanged(accounts) => {
                            engine.set_accounts(accounts);
                            publish(&engine, &views_tx, &latest_state);
                        }
                        Msg::Query(reply) => {
                            let _ = reply.send(engine.view().clone());
                        }
                        Msg::RefreshDone { task_id, outcome, notice } => {
                            match outcome {
                                Ok((entries, users)) => {
                                    debug!(
                                        event = "runtime.refresh_done",
                                        task_id = %task_id,
                                        entries = entries.len(),
                                        "runtime.refresh_done"
                                    );
                                    engine.install_snapshot(entries, users, notice);
                                }
                                Err(message) => {
                                    warn!(
                                        event = "runtime.refresh_failed",
                                        task_id = %task_id,
                                        error = %message,
                                        "runtime.refresh_failed"
                                    );
                                    engine.refresh_failed(message);
                                }
                            }
                            publish(&engine, &views_tx, &latest_state);
                        }
                        Msg::BatchDone { task_id, error } => {
                            match &error {
                                None => debug!(
                                    event = "runtime.batch_done",
                                    task_id = %task_id,
                                    "runtime.batch_done"
                                ),
                                Some(message) => warn!(
                                    event = "runtime.batch_failed",
                                    task_id = %task_id,
                                    error = %message,
                                    "runtime.batch_failed"
                                ),
                            }
                            engine.batch_done(error);
                            publish(&engine, &views_tx, &latest_state);
                        }
                    }
                }
            }
        }
    });

    EngineHandle {
        tx,
        views,
        latest,
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    }
}

fn publish(
    engine: &ListEngine,
    views: &broadcast::Sender<ListView>,
    latest: &Mutex<ListView>,
) {
    let view = engine.view().clone();
    *latest.lock().expect("view mutex poisoned") = view.clone();
    let _ = views.send(view);
}

fn dispatch(
    command: Command,
    kind: SubjectKind,
    catalog: Arc<BackupCatalog>,
    scanner: Arc<dyn Scanner>,
    executor: Arc<dyn BatchExecutor>,
    tx: mpsc::Sender<Msg>,
) {
    let task_id = Uuid::new_v4();
    match command {
        Command::Refresh => {
            debug!(event = "runtime.refresh_start", task_id = %task_id, "runtime.refresh_start");
            tokio::spawn(async move {
                let outcome = run_refresh(&catalog, scanner.as_ref(), kind)
                    .await
                    .map_err(|e| e.to_string());
                let _ = tx
                    .send(Msg::RefreshDone {
                        task_id,
                        outcome,
                        notice: None,
                    })
                    .await;
            });
        }
        Command::DeleteThenRefresh(identities) => {
            debug!(
                event = "runtime.delete_start",
                task_id = %task_id,
                count = identities.len(),
                "runtime.delete_start"
            );
            tokio::spawn(async move {
                let mut notice = None;
                for identity in &identities {
                    match executor.delete(identity).await {
                        Ok(()) => {
                            if let Err(e) = catalog.remove(identity).await {
                                warn!(
                                    event = "runtime.delete_catalog_failed",
                                    task_id = %task_id,
                                    identity = %identity,
                                    error = %e,
                                    "runtime.delete_catalog_failed"
                                );
                            }
                        }
                        Err(e) => {
                            warn!(
                                event = "runtime.delete_failed",
                                task_id = %task_id,
                                identity = %identity,
                                error = %e,
                                "runtime.delete_failed"
                            );
                            notice = Some(format!("delete failed: {e}"));
                            break;
                        }
                    }
                }
                // One rescan per round, even after a failed delete, so the
                // catalog reflects whatever actually happened on disk.
                let outcome = run_refresh(&catalog, scanner.as_ref(), kind)
                    .await
                    .map_err(|e| e.to_string());
                let _ = tx
                    .send(Msg::RefreshDone {
                        task_id,
                        outcome,
                        notice,
                    })
                    .await;
            });
        }
        Command::Process {
            selection,
            identities,
        } => {
            debug!(
                event = "runtime.process_start",
                task_id = %task_id,
                selection = %selection,
                count = identities.len(),
                "runtime.process_start"
            );
            tokio::spawn(async move {
                let error = executor
                    .process(selection, &identities)
                    .await
                    .err()
                    .map(|e| e.to_string());
                let _ = tx.send(Msg::BatchDone { task_id, error }).await;
            });
        }
    }
}

async fn run_refresh(
    catalog: &BackupCatalog,
    scanner: &dyn Scanner,
    kind: SubjectKind,
) -> Result<Snapshot> {
    let scanned = scanner.scan(None).await?;
    catalog.replace_all(kind, &scanned).await?;
    load_snapshot(catalog, kind).await
}

async fn load_snapshot(catalog: &BackupCatalog, kind: SubjectKind) -> Result<Snapshot> {
    let entries = catalog.entries_for(kind).await?;
    let users = catalog.user_ids(kind).await?;
    Ok((entries, users))
}
