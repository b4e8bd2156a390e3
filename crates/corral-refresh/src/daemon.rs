//! Refresh queue and worker
//!
//! Two producers feed one bounded queue: the periodic sweep and on-demand
//! requests (authentication triggers and administrative calls). A single
//! worker drains the queue, so no user is ever refreshed re-entrantly.
//!
//! ```text
//!   authenticator ──trigger (try_send)──┐
//!   admin API ─────refresh_user/all─────┼──► queue ──► worker ──► Refresher
//!   sweep ticker ──All { force: false }─┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RefreshError, Result};
use crate::refresher::{RefreshReport, Refresher};

/// Default max age of a user's attributes before a trigger refreshes them
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(3600);

/// Default period of the full sweep
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Default capacity of the refresh queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Refresh daemon configuration
#[derive(Clone, Debug)]
pub struct RefreshConfig {
    /// Skip non-forced refreshes of users refreshed more recently than this
    pub max_age: Duration,
    /// Period of the full sweep, `None` disables it
    pub sweep_interval: Option<Duration>,
    /// Bound of the refresh queue; triggers beyond it are dropped
    pub queue_capacity: usize,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            max_age: DEFAULT_MAX_AGE,
            sweep_interval: Some(DEFAULT_SWEEP_INTERVAL),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

enum Job {
    User {
        user_id: String,
        force: bool,
        reply: Option<oneshot::Sender<Result<RefreshReport>>>,
    },
    All {
        force: bool,
        reply: Option<oneshot::Sender<Result<usize>>>,
    },
}

/// Non-blocking refresh signal used on the authentication path
pub trait RefreshTrigger: Send + Sync {
    /// Ask for `user_id` to be considered for refresh
    ///
    /// Never blocks and never fails; the signal may be dropped.
    fn trigger(&self, user_id: &str);
}

/// Cloneable handle for submitting refresh work
#[derive(Clone)]
pub struct RefreshHandle {
    tx: mpsc::Sender<Job>,
    pending: Arc<DashSet<String>>,
}

impl RefreshHandle {
    /// Refresh `user_id` now, ignoring max age, and wait for the result
    pub async fn refresh_user(&self, user_id: &str) -> Result<RefreshReport> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Job::User {
                user_id: user_id.to_string(),
                force: true,
                reply: Some(reply),
            })
            .await
            .map_err(|_| RefreshError::Stopped)?;
        rx.await.map_err(|_| RefreshError::Stopped)?
    }

    /// Refresh every user now, ignoring max age
    ///
    /// Returns the number of users refreshed successfully.
    pub async fn refresh_all(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Job::All {
                force: true,
                reply: Some(reply),
            })
            .await
            .map_err(|_| RefreshError::Stopped)?;
        rx.await.map_err(|_| RefreshError::Stopped)?
    }

    /// Number of triggered users waiting in the queue
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl RefreshTrigger for RefreshHandle {
    fn trigger(&self, user_id: &str) {
        // Coalesce: a user already queued is not queued twice.
        if !self.pending.insert(user_id.to_string()) {
            return;
        }
        let job = Job::User {
            user_id: user_id.to_string(),
            force: false,
            reply: None,
        };
        if let Err(e) = self.tx.try_send(job) {
            self.pending.remove(user_id);
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    debug!(user = %user_id, "Refresh queue full, dropping trigger")
                }
                mpsc::error::TrySendError::Closed(_) => {
                    debug!(user = %user_id, "Refresh worker stopped, dropping trigger")
                }
            }
        }
    }
}

/// Background refresh daemon
///
/// Construct with [`RefreshDaemon::new`], hand out [`RefreshHandle`]s, then
/// start it with [`RefreshDaemon::spawn`].
pub struct RefreshDaemon {
    refresher: Refresher,
    config: RefreshConfig,
    rx: mpsc::Receiver<Job>,
    handle: RefreshHandle,
}

impl RefreshDaemon {
    /// Create a daemon around `refresher`
    pub fn new(refresher: Refresher, config: RefreshConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            refresher,
            config,
            rx,
            handle: RefreshHandle {
                tx,
                pending: Arc::new(DashSet::new()),
            },
        }
    }

    /// Handle for submitting work
    pub fn handle(&self) -> RefreshHandle {
        self.handle.clone()
    }

    /// Start the sweep ticker and the worker; both stop when `cancel` fires
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        if let Some(period) = self.config.sweep_interval.filter(|p| !p.is_zero()) {
            tokio::spawn(run_sweep(self.handle.tx.clone(), period, cancel.clone()));
        }
        tokio::spawn(self.run(cancel))
    }

    async fn run(mut self, cancel: CancellationToken) {
        info!(
            max_age_secs = self.config.max_age.as_secs(),
            queue_capacity = self.config.queue_capacity,
            "Refresh worker started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                job = self.rx.recv() => match job {
                    Some(job) => self.process(job).await,
                    None => break,
                },
            }
        }
        info!("Refresh worker stopped");
    }

    async fn process(&self, job: Job) {
        match job {
            Job::User {
                user_id,
                force,
                reply,
            } => {
                if reply.is_none() {
                    self.handle.pending.remove(&user_id);
                }
                let result = self.refresher.refresh_user(&user_id, force).await;
                if let Err(e) = &result {
                    warn!(user = %user_id, error = %e, "User refresh failed");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Job::All { force, reply } => {
                let result = self.refresh_all(force).await;
                if let Err(e) = &result {
                    warn!(error = %e, "Full refresh failed");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
        }
    }

    async fn refresh_all(&self, force: bool) -> Result<usize> {
        let users = self.refresher.users().list_users().await?;
        info!(users = users.len(), force, "Refreshing all users");
        let mut refreshed = 0;
        for user in users {
            let Some(user_id) = user.metadata.name.as_deref() else {
                continue;
            };
            match self.refresher.refresh_user(user_id, force).await {
                Ok(report) if !report.skipped => refreshed += 1,
                Ok(_) => {}
                Err(e) => warn!(user = %user_id, error = %e, "User refresh failed"),
            }
        }
        Ok(refreshed)
    }
}

async fn run_sweep(tx: mpsc::Sender<Job>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                debug!("Queueing periodic refresh sweep");
                if tx.send(Job::All { force: false, reply: None }).await.is_err() {
                    break;
                }
            }
        }
    }
}
