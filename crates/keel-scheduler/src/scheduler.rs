//! BuildScheduler: one build at a time, cluster-wide.
//!
//! The scheduler owns a single build slot and a FIFO queue of pending
//! jobs:
//! - A request while the slot is free starts immediately
//! - A request while another build runs is queued behind it
//! - A second request for an app that is already queued replaces the
//!   queued source in place; both callers receive the outcome of that job
//!
//! The slot is released as soon as the image is built and recorded. Rolling
//! the new version out runs in its own task, so the next queued build starts
//! while the previous app's service is still being updated.
//!
//! Serializing every build, not only builds of the same app, caps the
//! cluster at one build at a time.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use keel_build::BuildLogsManager;
use keel_core::{ApiStatus, BuildSource, BuiltImage, DeployFailure};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{SchedulerError, SchedulerResult};

/// A version that was built and recorded as deployed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployedVersion {
    pub app: String,
    pub version: u32,
    pub image: BuiltImage,
}

pub type DeployOutcome = Result<DeployedVersion, DeployFailure>;

/// The work a scheduled job performs.
#[async_trait]
pub trait DeployRunner: Send + Sync {
    /// Build the image and record it. Runs while holding the build slot.
    async fn build(&self, app: &str, source: &BuildSource) -> SchedulerResult<DeployedVersion>;

    /// Roll a recorded version out. Runs after the slot is released.
    async fn activate(&self, deployed: &DeployedVersion) -> SchedulerResult<()>;
}

/// A job waiting for the build slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedBuild {
    pub app: String,
    pub source: BuildSource,
}

struct Job {
    app: String,
    source: BuildSource,
    waiters: Vec<oneshot::Sender<DeployOutcome>>,
}

#[derive(Default)]
struct Slot {
    active: Option<String>,
    queue: VecDeque<Job>,
}

struct Inner {
    runner: Arc<dyn DeployRunner>,
    logs: BuildLogsManager,
    slot: Mutex<Slot>,
}

#[derive(Clone)]
pub struct BuildScheduler {
    inner: Arc<Inner>,
}

/// Pending result of a scheduled deploy.
pub struct DeployHandle {
    app: String,
    rx: oneshot::Receiver<DeployOutcome>,
}

impl DeployHandle {
    pub fn app(&self) -> &str {
        &self.app
    }

    /// Wait for the job this request ended up in.
    pub async fn wait(self) -> DeployOutcome {
        let DeployHandle { app, rx } = self;
        rx.await.unwrap_or_else(|_| {
            Err(DeployFailure::new(
                ApiStatus::Generic,
                format!("Deploy for {app} was abandoned"),
            ))
        })
    }
}

impl BuildScheduler {
    pub fn new(runner: Arc<dyn DeployRunner>, logs: BuildLogsManager) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                logs,
                slot: Mutex::new(Slot::default()),
            }),
        }
    }

    pub fn logs(&self) -> &BuildLogsManager {
        &self.inner.logs
    }

    /// Schedule a deploy of `app` from `source`.
    ///
    /// The request is queued before this returns, so calls made in sequence
    /// are served in that order. Must be called inside a Tokio runtime.
    pub fn schedule_deploy(&self, app: &str, source: BuildSource) -> DeployHandle {
        let (tx, rx) = oneshot::channel();
        let log = self.inner.logs.for_app(app);

        let start = {
            let mut slot = self.inner.lock();
            log.clear();
            match slot.active.clone() {
                Some(active) => {
                    if let Some(job) = slot.queue.iter_mut().find(|j| j.app == app) {
                        log.log(format!(
                            "A build for {app} was queued, it's now being replaced with a new build..."
                        ));
                        info!(%app, "queued build replaced");
                        job.source = source;
                        job.waiters.push(tx);
                    } else {
                        log.log(format!(
                            "An active build ({active}) is in progress. This build is queued..."
                        ));
                        info!(%app, %active, "build queued");
                        slot.queue.push_back(Job {
                            app: app.to_string(),
                            source,
                            waiters: vec![tx],
                        });
                    }
                    None
                }
                None => {
                    slot.active = Some(app.to_string());
                    Some(Job {
                        app: app.to_string(),
                        source,
                        waiters: vec![tx],
                    })
                }
            }
        };

        if let Some(job) = start {
            let inner = self.inner.clone();
            tokio::spawn(async move { inner.drain(job).await });
        }
        DeployHandle {
            app: app.to_string(),
            rx,
        }
    }

    /// Schedule and wait in one call.
    pub async fn deploy(&self, app: &str, source: BuildSource) -> DeployOutcome {
        self.schedule_deploy(app, source).wait().await
    }

    /// Whether `app` holds the slot or waits in the queue.
    pub fn is_app_building(&self, app: &str) -> bool {
        let slot = self.inner.lock();
        slot.active.as_deref() == Some(app) || slot.queue.iter().any(|j| j.app == app)
    }

    /// The app currently holding the slot.
    pub fn active_build(&self) -> Option<String> {
        self.inner.lock().active.clone()
    }

    pub fn queued(&self) -> Vec<QueuedBuild> {
        self.inner
            .lock()
            .queue
            .iter()
            .map(|j| QueuedBuild {
                app: j.app.clone(),
                source: j.source.clone(),
            })
            .collect()
    }

    /// Fail with IllegalOperation while `app` is building or queued.
    pub fn ensure_not_building(&self, app: &str) -> SchedulerResult<()> {
        if self.is_app_building(app) {
            return Err(SchedulerError::IllegalOperation(format!(
                "Build in-progress for {app}. Please wait..."
            )));
        }
        Ok(())
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `first`, then every job queued behind it, one at a time.
    async fn drain(self: Arc<Self>, first: Job) {
        let mut next = Some(first);
        while let Some(Job {
            app,
            source,
            waiters,
        }) = next.take()
        {
            debug!(%app, source = %source.describe(), "build slot taken");
            let built = self.runner.build(&app, &source).await;

            next = {
                let mut slot = self.lock();
                let job = slot.queue.pop_front();
                slot.active = job.as_ref().map(|j| j.app.clone());
                job
            };

            match built {
                Ok(deployed) => self.spawn_activation(deployed, waiters),
                Err(e) => {
                    warn!(%app, error = %e, "deploy failed");
                    self.logs.for_app(&app).on_build_failed(&e.to_string());
                    notify(waiters, Err(e.to_failure()));
                }
            }
        }
        debug!("build queue drained");
    }

    fn spawn_activation(&self, deployed: DeployedVersion, waiters: Vec<oneshot::Sender<DeployOutcome>>) {
        let runner = self.runner.clone();
        let logs = self.logs.clone();
        tokio::spawn(async move {
            let outcome = match runner.activate(&deployed).await {
                Ok(()) => {
                    info!(app = %deployed.app, version = deployed.version, "deploy finished");
                    Ok(deployed)
                }
                Err(e) => {
                    warn!(app = %deployed.app, error = %e, "deploy failed after build");
                    logs.for_app(&deployed.app).on_build_failed(&e.to_string());
                    Err(e.to_failure())
                }
            };
            notify(waiters, outcome);
        });
    }
}

fn notify(waiters: Vec<oneshot::Sender<DeployOutcome>>, outcome: DeployOutcome) {
    for waiter in waiters {
        // A caller that stopped waiting is not an error.
        let _ = waiter.send(outcome.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Runner whose builds block until the test hands out a permit.
    struct GatedRunner {
        gate: Semaphore,
        started: Mutex<Vec<(String, BuildSource)>>,
        failing: Mutex<HashSet<String>>,
        next_version: AtomicU32,
    }

    impl GatedRunner {
        fn new() -> Self {
            Self {
                gate: Semaphore::new(0),
                started: Mutex::new(Vec::new()),
                failing: Mutex::new(HashSet::new()),
                next_version: AtomicU32::new(0),
            }
        }

        fn started(&self) -> Vec<(String, BuildSource)> {
            self.started.lock().unwrap().clone()
        }

        fn started_apps(&self) -> Vec<String> {
            self.started().into_iter().map(|(a, _)| a).collect()
        }
    }

    #[async_trait]
    impl DeployRunner for GatedRunner {
        async fn build(&self, app: &str, source: &BuildSource) -> SchedulerResult<DeployedVersion> {
            self.started
                .lock()
                .unwrap()
                .push((app.to_string(), source.clone()));
            self.gate
                .acquire()
                .await
                .map_err(|e| SchedulerError::Generic(e.to_string()))?
                .forget();
            if self.failing.lock().unwrap().contains(app) {
                return Err(SchedulerError::Generic("boom".into()));
            }
            let version = self.next_version.fetch_add(1, Ordering::SeqCst);
            Ok(DeployedVersion {
                app: app.to_string(),
                version,
                image: BuiltImage {
                    image_name: format!("img-keel-{app}:{version}"),
                    source_revision: None,
                },
            })
        }

        async fn activate(&self, _deployed: &DeployedVersion) -> SchedulerResult<()> {
            Ok(())
        }
    }

    fn source(tag: &str) -> BuildSource {
        BuildSource::Definition {
            content: format!(r#"{{"schemaVersion":2,"imageName":"{tag}"}}"#),
            source_revision: None,
        }
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn scheduler() -> (Arc<GatedRunner>, BuildScheduler) {
        let runner = Arc::new(GatedRunner::new());
        let scheduler = BuildScheduler::new(runner.clone(), BuildLogsManager::new(50));
        (runner, scheduler)
    }

    #[tokio::test]
    async fn test_single_build_runs_immediately() {
        let (runner, scheduler) = scheduler();
        runner.gate.add_permits(1);
        let deployed = scheduler.deploy("api", source("a")).await.unwrap();
        assert_eq!(deployed.app, "api");
        assert_eq!(deployed.image.image_name, "img-keel-api:0");
        assert!(!scheduler.is_app_building("api"));
    }

    #[tokio::test]
    async fn test_builds_run_one_at_a_time_in_fifo_order() {
        let (runner, scheduler) = scheduler();
        let api = scheduler.schedule_deploy("api", source("a"));
        let worker = scheduler.schedule_deploy("worker", source("w"));
        let web = scheduler.schedule_deploy("web", source("x"));

        wait_until(|| runner.started().len() == 1).await;
        assert_eq!(scheduler.active_build().as_deref(), Some("api"));
        assert_eq!(
            scheduler.queued().iter().map(|q| q.app.as_str()).collect::<Vec<_>>(),
            vec!["worker", "web"]
        );
        assert!(scheduler.is_app_building("web"));

        runner.gate.add_permits(1);
        assert_eq!(api.wait().await.unwrap().version, 0);
        wait_until(|| runner.started().len() == 2).await;
        assert_eq!(runner.started_apps(), vec!["api", "worker"]);

        runner.gate.add_permits(2);
        assert_eq!(worker.wait().await.unwrap().version, 1);
        assert_eq!(web.wait().await.unwrap().version, 2);
        assert_eq!(runner.started_apps(), vec!["api", "worker", "web"]);
        assert_eq!(scheduler.active_build(), None);
    }

    #[tokio::test]
    async fn test_queued_request_for_same_app_is_replaced() {
        let (runner, scheduler) = scheduler();
        let api = scheduler.schedule_deploy("api", source("a"));
        wait_until(|| runner.started().len() == 1).await;

        let first = scheduler.schedule_deploy("worker", source("old"));
        let second = scheduler.schedule_deploy("worker", source("new"));
        let queued = scheduler.queued();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].source, source("new"));
        assert!(
            scheduler
                .logs()
                .logs("worker")
                .lines
                .iter()
                .any(|l| l.contains("now being replaced"))
        );

        runner.gate.add_permits(2);
        api.wait().await.unwrap();
        let a = first.wait().await.unwrap();
        let b = second.wait().await.unwrap();
        assert_eq!(a, b);
        assert_eq!(runner.started().len(), 2);
        assert_eq!(runner.started()[1].1, source("new"));
    }

    #[tokio::test]
    async fn test_failure_reaches_caller_and_next_job_runs() {
        let (runner, scheduler) = scheduler();
        runner.failing.lock().unwrap().insert("api".into());
        let api = scheduler.schedule_deploy("api", source("a"));
        let worker = scheduler.schedule_deploy("worker", source("w"));
        runner.gate.add_permits(2);

        let err = api.wait().await.unwrap_err();
        assert_eq!(err.status, ApiStatus::Generic);
        assert_eq!(err.message, "boom");
        assert!(scheduler.logs().is_build_failed("api"));
        assert!(worker.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_ensure_not_building() {
        let (runner, scheduler) = scheduler();
        let api = scheduler.schedule_deploy("api", source("a"));
        let err = scheduler.ensure_not_building("api").unwrap_err();
        assert_eq!(err.status(), ApiStatus::IllegalOperation);
        assert_eq!(err.to_string(), "Build in-progress for api. Please wait...");
        assert!(scheduler.ensure_not_building("worker").is_ok());

        runner.gate.add_permits(1);
        api.wait().await.unwrap();
        assert!(scheduler.ensure_not_building("api").is_ok());
    }
}
