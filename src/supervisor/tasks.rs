//! Periodic loops and their restart supervision.

use crate::errors::EngineError;
use crate::risk::{RiskAlert, RiskAlertType};
use crate::state::{PositionStore, RiskLevel};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// A loop body run on a fixed interval.
#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    /// One tick. Transient errors skip the tick; any other error ends the
    /// loop and hands it to the supervisor.
    async fn run_once(&self) -> Result<(), EngineError>;
}

/// Health of a supervised component, as shown in the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ComponentHealth {
    Running,
    Restarting { restarts: u32 },
    Degraded { restarts: u32 },
    Stopped,
}

#[derive(Debug, Clone, Default)]
pub struct HealthBoard {
    inner: Arc<RwLock<BTreeMap<String, ComponentHealth>>>,
}

impl HealthBoard {
    pub async fn set(&self, component: &str, health: ComponentHealth) {
        self.inner.write().await.insert(component.to_string(), health);
    }

    pub async fn get(&self, component: &str) -> Option<ComponentHealth> {
        self.inner.read().await.get(component).copied()
    }

    pub async fn snapshot(&self) -> BTreeMap<String, ComponentHealth> {
        self.inner.read().await.clone()
    }

    pub async fn any_degraded(&self) -> bool {
        self.inner
            .read()
            .await
            .values()
            .any(|h| matches!(h, ComponentHealth::Degraded { .. }))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub backoff: Duration,
    /// A run at least this long before failing starts the budget over.
    pub stable_after: Duration,
}

fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// Tick `task` until shutdown or a non-transient failure.
pub async fn run_periodic(
    task: &dyn PeriodicTask,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), EngineError> {
    let name = task.name();
    let mut interval = tokio::time::interval(task.interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        if shutdown_requested(&shutdown) {
            return Ok(());
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || shutdown_requested(&shutdown) {
                    return Ok(());
                }
            }
            _ = interval.tick() => match task.run_once().await {
                Ok(()) => {}
                Err(e) if e.is_transient() => warn!(task = name, error = %e, "Tick skipped"),
                Err(e) => return Err(e),
            },
        }
    }
}

/// Run `task` on its own tokio task, restarting it after failures or panics.
///
/// Once `policy.max_restarts` is used up the component is marked degraded
/// and the halt flag is forced on. Failures separated by healthy runs of
/// `policy.stable_after` or longer do not add up.
pub async fn supervise(
    task: Arc<dyn PeriodicTask>,
    policy: RestartPolicy,
    store: PositionStore,
    health: HealthBoard,
    mut shutdown: watch::Receiver<bool>,
) {
    let name = task.name();
    let mut restarts = 0u32;

    loop {
        health.set(name, ComponentHealth::Running).await;
        info!(task = name, restarts, "▶️ Task started");

        let started = tokio::time::Instant::now();
        let runner = task.clone();
        let rx = shutdown.clone();
        let handle = tokio::spawn(async move { run_periodic(runner.as_ref(), rx).await });

        let failure = match handle.await {
            Ok(Ok(())) => {
                health.set(name, ComponentHealth::Stopped).await;
                info!(task = name, "⏹️ Task stopped");
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(e) if e.is_panic() => "task panicked".to_string(),
            Err(_) => {
                health.set(name, ComponentHealth::Stopped).await;
                return;
            }
        };

        if shutdown_requested(&shutdown) {
            health.set(name, ComponentHealth::Stopped).await;
            return;
        }

        if restarts > 0 && started.elapsed() >= policy.stable_after {
            info!(task = name, restarts, "Task ran stable, restart budget reset");
            restarts = 0;
        }

        if restarts >= policy.max_restarts {
            error!(
                task = name,
                restarts,
                error = %failure,
                "Restart budget exhausted, component degraded"
            );
            health.set(name, ComponentHealth::Degraded { restarts }).await;
            if let Err(e) = store.set_halt(true).await {
                error!(task = name, error = %e, "Could not force halt flag");
            }
            RiskAlert::new(
                RiskAlertType::ComponentDegraded {
                    component: name.to_string(),
                    restarts,
                },
                RiskLevel::High,
                format!("{} failed after {} restarts: {}", name, restarts, failure),
            )
            .emit();
            return;
        }

        restarts += 1;
        warn!(
            task = name,
            restarts,
            error = %failure,
            backoff_ms = policy.backoff.as_millis() as u64,
            "Task failed, restarting"
        );
        health.set(name, ComponentHealth::Restarting { restarts }).await;

        tokio::select! {
            _ = tokio::time::sleep(policy.backoff) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || shutdown_requested(&shutdown) {
                    health.set(name, ComponentHealth::Stopped).await;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StoreError;
    use crate::test_support::memory_store;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with `error` for the first `failures` ticks, then succeeds.
    struct ScriptedTask {
        ticks: AtomicU32,
        failures: u32,
        error: fn() -> EngineError,
        panics: bool,
    }

    impl ScriptedTask {
        fn new(failures: u32, error: fn() -> EngineError) -> Self {
            Self {
                ticks: AtomicU32::new(0),
                failures,
                error,
                panics: false,
            }
        }
    }

    #[async_trait]
    impl PeriodicTask for ScriptedTask {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(1)
        }

        async fn run_once(&self) -> Result<(), EngineError> {
            let tick = self.ticks.fetch_add(1, Ordering::SeqCst);
            if tick < self.failures {
                if self.panics {
                    panic!("scripted panic");
                }
                return Err((self.error)());
            }
            Ok(())
        }
    }

    fn policy(max_restarts: u32) -> RestartPolicy {
        RestartPolicy {
            max_restarts,
            backoff: Duration::from_millis(1),
            stable_after: Duration::from_secs(3600),
        }
    }

    /// Fails once every `period` ticks, forever.
    struct FlakyTask {
        ticks: AtomicU32,
        period: u32,
    }

    #[async_trait]
    impl PeriodicTask for FlakyTask {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(2)
        }

        async fn run_once(&self) -> Result<(), EngineError> {
            let tick = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
            if tick % self.period == 0 {
                return Err(EngineError::NoMarket);
            }
            Ok(())
        }
    }

    async fn wait_until_ticks(task: &ScriptedTask, ticks: u32) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while task.ticks.load(Ordering::SeqCst) < ticks {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_transient_errors_do_not_end_the_loop() {
        let task = Arc::new(ScriptedTask::new(3, || {
            EngineError::Store(StoreError::Unavailable("locked".into()))
        }));
        let (tx, rx) = watch::channel(false);
        let runner = task.clone();
        let handle = tokio::spawn(async move { run_periodic(runner.as_ref(), rx).await });

        wait_until_ticks(&task, 5).await;
        tx.send(true).unwrap();

        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_failed_task_is_restarted() {
        let task = Arc::new(ScriptedTask::new(2, || EngineError::NoMarket));
        let store = memory_store();
        let health = HealthBoard::default();
        let (tx, rx) = watch::channel(false);

        let supervisor = tokio::spawn(supervise(
            task.clone(),
            policy(3),
            store.clone(),
            health.clone(),
            rx,
        ));

        wait_until_ticks(&task, 5).await;
        assert_eq!(health.get("scripted").await, Some(ComponentHealth::Running));

        tx.send(true).unwrap();
        supervisor.await.unwrap();
        assert_eq!(health.get("scripted").await, Some(ComponentHealth::Stopped));
        assert!(!store.is_halted().await.unwrap());
    }

    #[tokio::test]
    async fn test_exhausted_budget_degrades_and_halts() {
        let task = Arc::new(ScriptedTask::new(u32::MAX, || EngineError::NoMarket));
        let store = memory_store();
        let health = HealthBoard::default();
        let (_tx, rx) = watch::channel(false);

        tokio::time::timeout(
            Duration::from_secs(5),
            supervise(task.clone(), policy(2), store.clone(), health.clone(), rx),
        )
        .await
        .unwrap();

        assert_eq!(task.ticks.load(Ordering::SeqCst), 3);
        assert_eq!(
            health.get("scripted").await,
            Some(ComponentHealth::Degraded { restarts: 2 })
        );
        assert!(health.any_degraded().await);
        assert!(store.is_halted().await.unwrap());
    }

    #[tokio::test]
    async fn test_panics_count_against_the_budget() {
        let task = Arc::new(ScriptedTask {
            panics: true,
            ..ScriptedTask::new(u32::MAX, || EngineError::NoMarket)
        });
        let store = memory_store();
        let health = HealthBoard::default();
        let (_tx, rx) = watch::channel(false);

        tokio::time::timeout(
            Duration::from_secs(5),
            supervise(task.clone(), policy(1), store.clone(), health.clone(), rx),
        )
        .await
        .unwrap();

        assert_eq!(
            health.get("scripted").await,
            Some(ComponentHealth::Degraded { restarts: 1 })
        );
        assert!(store.is_halted().await.unwrap());
    }

    #[tokio::test]
    async fn test_budget_resets_after_stable_run() {
        // Each run lasts ~20 ticks of 2ms before failing; 10ms counts as stable
        let task = Arc::new(FlakyTask {
            ticks: AtomicU32::new(0),
            period: 20,
        });
        let store = memory_store();
        let health = HealthBoard::default();
        let (tx, rx) = watch::channel(false);
        let policy = RestartPolicy {
            max_restarts: 1,
            backoff: Duration::from_millis(1),
            stable_after: Duration::from_millis(10),
        };

        let supervisor = tokio::spawn(supervise(
            task.clone(),
            policy,
            store.clone(),
            health.clone(),
            rx,
        ));

        tokio::time::timeout(Duration::from_secs(5), async {
            while task.ticks.load(Ordering::SeqCst) < 100 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!health.any_degraded().await);
        assert!(!store.is_halted().await.unwrap());

        tx.send(true).unwrap();
        supervisor.await.unwrap();
    }
}
