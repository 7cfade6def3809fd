//! The agent lifecycle: enrollment, initial policy, and the five loops.
//!
//! Each loop shares one backoff driver: a successful tick sleeps the
//! loop's nominal interval, a failed tick sleeps an exponentially growing
//! delay capped at the configured maximum. All loops hang off a single
//! cancellation channel; the first non-cancellation error any loop
//! returns cancels the rest and becomes the agent's exit error, so a
//! supervising init system can restart the process.

use std::sync::Arc;
use std::time::Duration;

use orchard_core::adapters::AdapterError;
use orchard_core::adapters::apps::AppsManager;
use orchard_core::adapters::browser::BrowserManager;
use orchard_core::adapters::network::NetworkManager;
use orchard_core::adapters::security::SecurityManager;
use orchard_core::adapters::updates::UpdatesManager;
use orchard_core::api::{ApiError, Client, Event, ReportEventsRequest, ReportStateRequest};
use orchard_core::attestation::{AttestError, AttestationManager, HostTpm, TpmProvider};
use orchard_core::config::Config;
use orchard_core::enroll::{Credentials, EnrollError, EnrollManager};
use orchard_core::logins::LoginWatcher;
use orchard_core::policy::{PolicyError, PolicyManager, Verifier, VerifierError};
use orchard_core::queue::{DurableQueue, EventQueue, QueueError, StateQueue};
use orchard_core::state::Collector;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Fatal agent errors.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The shared context was cancelled; the entrypoint treats this as a
    /// clean shutdown.
    #[error("agent cancelled")]
    Cancelled,

    /// The API client could not be constructed.
    #[error("init api client: {0}")]
    Client(#[from] ApiError),

    /// The pinned policy key could not be loaded.
    #[error("load policy key: {0}")]
    PolicyKey(#[from] VerifierError),

    /// Enrollment failed; without credentials nothing else can run.
    #[error(transparent)]
    Enroll(#[from] EnrollError),

    /// The initial policy shipped with enrollment failed to apply.
    #[error("apply initial policy: {0}")]
    InitialPolicy(#[source] PolicyError),

    /// A loop task aborted abnormally.
    #[error("loop task failed: {0}")]
    LoopPanic(String),
}

/// Errors a single loop tick can produce; all feed the loop's backoff.
#[derive(Debug, thiserror::Error)]
enum WorkError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Attest(#[from] AttestError),

    #[error("persist credentials: {0}")]
    Persist(#[from] EnrollError),

    #[error("{context}: timed out")]
    Timeout {
        context: &'static str,
    },
}

/// The five background loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopKind {
    Policy,
    State,
    Events,
    Logins,
    Attestation,
}

impl LoopKind {
    const ALL: [Self; 5] = [
        Self::Policy,
        Self::State,
        Self::Events,
        Self::Logins,
        Self::Attestation,
    ];

    const fn name(self) -> &'static str {
        match self {
            Self::Policy => "policy",
            Self::State => "state",
            Self::Events => "events",
            Self::Logins => "logins",
            Self::Attestation => "attestation",
        }
    }
}

/// Builds an [`Agent`], allowing tests to substitute host adapters.
pub struct AgentBuilder {
    config: Config,
    apps: Option<AppsManager>,
    browser: Option<BrowserManager>,
    updates: Option<UpdatesManager>,
    network: Option<NetworkManager>,
    security: Option<SecurityManager>,
    logins: Option<LoginWatcher>,
    tpm: Option<Arc<dyn TpmProvider>>,
}

impl AgentBuilder {
    /// Starts a builder over the given configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            apps: None,
            browser: None,
            updates: None,
            network: None,
            security: None,
            logins: None,
            tpm: None,
        }
    }

    /// Substitutes the application manager.
    #[must_use]
    pub fn apps(mut self, apps: AppsManager) -> Self {
        self.apps = Some(apps);
        self
    }

    /// Substitutes the browser manager.
    #[must_use]
    pub fn browser(mut self, browser: BrowserManager) -> Self {
        self.browser = Some(browser);
        self
    }

    /// Substitutes the updates manager.
    #[must_use]
    pub fn updates(mut self, updates: UpdatesManager) -> Self {
        self.updates = Some(updates);
        self
    }

    /// Substitutes the network manager.
    #[must_use]
    pub fn network(mut self, network: NetworkManager) -> Self {
        self.network = Some(network);
        self
    }

    /// Substitutes the security manager.
    #[must_use]
    pub fn security(mut self, security: SecurityManager) -> Self {
        self.security = Some(security);
        self
    }

    /// Substitutes the login watcher.
    #[must_use]
    pub fn logins(mut self, logins: LoginWatcher) -> Self {
        self.logins = Some(logins);
        self
    }

    /// Substitutes the TPM provider.
    #[must_use]
    pub fn tpm(mut self, tpm: Arc<dyn TpmProvider>) -> Self {
        self.tpm = Some(tpm);
        self
    }

    /// Wires the agent together.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError`] when the API client or the pinned policy
    /// key cannot be constructed.
    pub fn build(self) -> Result<Agent, AgentError> {
        let config = self.config;
        let client = Client::new(&config.backend_url)?;
        let verifier = Verifier::from_file(&config.policy_public_key)?;

        let apps = Arc::new(self.apps.unwrap_or_default());
        let browser = Arc::new(self.browser.unwrap_or_default());
        let updates = Arc::new(self.updates.unwrap_or_default());
        let network = Arc::new(self.network.unwrap_or_default());
        let security = Arc::new(self.security.unwrap_or_default());

        let policy = PolicyManager::new(
            &config.policy_cache_path,
            Some(verifier),
            Arc::clone(&apps) as _,
            Arc::clone(&browser) as _,
            Arc::clone(&updates) as _,
            Arc::clone(&network) as _,
            Arc::clone(&security) as _,
        );
        let collector = Collector::new(Arc::clone(&apps) as _, Arc::clone(&updates) as _);
        let attestation = AttestationManager::new(self.tpm.unwrap_or_else(|| Arc::new(HostTpm)));

        Ok(Agent {
            enroll: EnrollManager::new(&config, client.clone()),
            client,
            policy,
            collector,
            event_queue: DurableQueue::new(&config.event_queue_path),
            state_queue: DurableQueue::new(&config.state_queue_path),
            updates,
            logins: self.logins.unwrap_or_default(),
            attestation,
            credentials: RwLock::new(Credentials::default()),
            policy_interval: config.intervals.policy_poll,
            state_interval: config.intervals.state_report,
            event_interval: config.intervals.event_flush,
            retry_backoff: config.intervals.retry_backoff,
            retry_max_delay: config.intervals.retry_max_delay,
        })
    }
}

/// The device agent: enrollment plus five concurrent loops.
pub struct Agent {
    client: Client,
    enroll: EnrollManager,
    policy: PolicyManager,
    collector: Collector,
    event_queue: EventQueue,
    state_queue: StateQueue,
    updates: Arc<UpdatesManager>,
    logins: LoginWatcher,
    attestation: AttestationManager,
    credentials: RwLock<Credentials>,
    policy_interval: Duration,
    state_interval: Duration,
    event_interval: Duration,
    retry_backoff: Duration,
    retry_max_delay: Duration,
}

impl Agent {
    /// Creates an agent over the real host adapters.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError`] when the API client or the pinned policy
    /// key cannot be constructed.
    pub fn new(config: Config) -> Result<Self, AgentError> {
        AgentBuilder::new(config).build()
    }

    /// Starts a builder for substituting host adapters.
    #[must_use]
    pub fn builder(config: Config) -> AgentBuilder {
        AgentBuilder::new(config)
    }

    /// Runs the agent until `shutdown` fires or a loop fails fatally.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Cancelled`] on a clean shutdown (the
    /// entrypoint maps it to exit code 0) and the first loop error
    /// otherwise.
    pub async fn run(
        self: Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), AgentError> {
        let (credentials, initial_policy) = self.enroll.ensure_enrollment().await?;
        *self.credentials.write().await = credentials.clone();

        if !initial_policy.version.is_empty() {
            info!(version = %initial_policy.version, "applying initial policy");
            let (events, result) = self.policy.apply(&initial_policy).await;
            self.append_events(events);
            if let Err(err) = result {
                self.collector.set_last_error(err.to_string());
                return Err(AgentError::InitialPolicy(err));
            }
        }

        if let Err(err) = self.event_queue.load() {
            warn!(error = %err, "failed to load queued events");
        }
        info!(device_id = %credentials.device_id, "agent ready");

        // Internal cancellation channel: flipped by the external shutdown
        // signal or by the first failing loop.
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let forwarder = tokio::spawn(forward_shutdown(shutdown, cancel_tx.clone()));

        let mut tasks = JoinSet::new();
        for kind in LoopKind::ALL {
            tasks.spawn(Arc::clone(&self).run_loop(kind, cancel_rx.clone()));
        }

        let mut first_error: Option<AgentError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) | Ok(Err(AgentError::Cancelled)) => {},
                Ok(Err(err)) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                    let _ = cancel_tx.send(true);
                },
                Err(join_err) => {
                    if first_error.is_none() {
                        first_error = Some(AgentError::LoopPanic(join_err.to_string()));
                    }
                    let _ = cancel_tx.send(true);
                },
            }
        }
        forwarder.abort();

        match first_error {
            Some(err) => Err(err),
            None => Err(AgentError::Cancelled),
        }
    }

    /// One loop: sleep, tick, feed failures into exponential backoff.
    async fn run_loop(
        self: Arc<Self>,
        kind: LoopKind,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), AgentError> {
        let interval = non_zero(self.loop_interval(kind), Duration::from_secs(1));
        let base_backoff = non_zero(self.retry_backoff, Duration::from_secs(1));
        let max_delay = non_zero(self.retry_max_delay, base_backoff * 16);

        let mut wait = Duration::ZERO;
        let mut delay = base_backoff;
        loop {
            if !wait.is_zero() {
                tokio::select! {
                    _ = cancel.changed() => return Err(AgentError::Cancelled),
                    () = tokio::time::sleep(wait) => {},
                }
            }
            if *cancel.borrow() {
                return Err(AgentError::Cancelled);
            }

            let result = tokio::select! {
                _ = cancel.changed() => return Err(AgentError::Cancelled),
                result = self.dispatch(kind) => result,
            };
            match result {
                Ok(()) => {
                    wait = interval;
                    delay = base_backoff;
                },
                Err(err) => {
                    warn!(task = kind.name(), error = %err, "loop tick failed");
                    wait = delay;
                    delay = std::cmp::min(delay * 2, max_delay);
                },
            }
        }
    }

    const fn loop_interval(&self, kind: LoopKind) -> Duration {
        match kind {
            LoopKind::Policy => self.policy_interval,
            // The attestation loop reuses the state-report cadence and
            // the login loop the event-flush cadence.
            LoopKind::State | LoopKind::Attestation => self.state_interval,
            LoopKind::Events | LoopKind::Logins => self.event_interval,
        }
    }

    async fn dispatch(&self, kind: LoopKind) -> Result<(), WorkError> {
        match kind {
            LoopKind::Policy => self.policy_tick().await,
            LoopKind::State => self.state_tick().await,
            LoopKind::Events => self.event_tick().await,
            LoopKind::Logins => self.login_tick().await,
            LoopKind::Attestation => self.attestation_tick().await,
        }
    }

    async fn policy_tick(&self) -> Result<(), WorkError> {
        match self.pull_and_apply_policy().await {
            Ok(()) => {
                self.collector.clear_last_error();
                Ok(())
            },
            Err(err) => {
                warn!(error = %err, "policy sync failed");
                self.collector.set_last_error(err.to_string());
                Err(err)
            },
        }
    }

    async fn pull_and_apply_policy(&self) -> Result<(), WorkError> {
        let mut version = self.policy.last_version().unwrap_or_default();
        if version.is_empty() {
            if let Ok(Some(cached)) = self.policy.cached_policy() {
                version = cached.version;
            }
        }

        let token = self.credentials.read().await.device_token.clone();
        let pulled = tokio::time::timeout(
            self.policy_interval,
            self.client.pull_policy(&token, &version),
        )
        .await
        .map_err(|_| WorkError::Timeout {
            context: "pull policy",
        })??;
        let Some(envelope) = pulled else {
            return Ok(());
        };

        info!(version = %envelope.version, "applying policy");
        let (events, result) = self.policy.apply(&envelope).await;
        self.append_events(events);
        result?;

        let mut credentials = self.credentials.read().await.clone();
        if let Some(rotated) = &envelope.rotated_token {
            if !rotated.is_empty() && *rotated != credentials.device_token {
                info!("rotating device token");
                credentials.device_token = rotated.clone();
            }
        }
        credentials.policy_version = envelope.version.clone();
        // Swap the whole struct so concurrent readers observe either the
        // old or the new credentials, never a mix.
        *self.credentials.write().await = credentials.clone();
        self.enroll.persist(&credentials, &envelope)?;
        Ok(())
    }

    async fn state_tick(&self) -> Result<(), WorkError> {
        // Rollback first, so a broken host rolls itself back even while
        // reporting is failing.
        let outcome = self.updates.ensure_rollback().await;
        self.append_events(outcome.events);
        if let Err(err) = outcome.result {
            warn!(error = %err, "rollback orchestration failed");
            let err = WorkError::from(err);
            self.collector.set_last_error(err.to_string());
            return Err(err);
        }

        match self.report_state().await {
            Ok(()) => {
                self.collector.clear_last_error();
                Ok(())
            },
            Err(err) => {
                warn!(error = %err, "state report failed");
                self.collector.set_last_error(err.to_string());
                Err(err)
            },
        }
    }

    async fn report_state(&self) -> Result<(), WorkError> {
        let snapshot = self.collector.snapshot().await;
        self.state_queue.append([snapshot])?;

        // Drain head-first: one snapshot per request, and only a server
        // ack removes it from the queue.
        loop {
            let pending = self.state_queue.load()?;
            let Some(head) = pending.first() else {
                return Ok(());
            };
            let credentials = self.credentials.read().await.clone();
            let request = ReportStateRequest {
                device_id: credentials.device_id,
                state: head.clone(),
            };
            tokio::time::timeout(
                self.state_interval,
                self.client.report_state(&credentials.device_token, &request),
            )
            .await
            .map_err(|_| WorkError::Timeout {
                context: "report state",
            })??;
            self.state_queue.replace(&pending[1..])?;
        }
    }

    async fn event_tick(&self) -> Result<(), WorkError> {
        match self.flush_events().await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(error = %err, "event flush failed");
                Err(err)
            },
        }
    }

    async fn flush_events(&self) -> Result<(), WorkError> {
        let pending = self.event_queue.load()?;
        if pending.is_empty() {
            return Ok(());
        }
        let credentials = self.credentials.read().await.clone();
        let request = ReportEventsRequest {
            device_id: credentials.device_id,
            events: pending,
        };
        tokio::time::timeout(
            self.event_interval,
            self.client.report_events(&credentials.device_token, &request),
        )
        .await
        .map_err(|_| WorkError::Timeout {
            context: "flush events",
        })??;
        self.event_queue.replace(&[])?;
        Ok(())
    }

    async fn login_tick(&self) -> Result<(), WorkError> {
        let events = match self.logins.collect().await {
            Ok(events) => events,
            Err(err) => {
                warn!(error = %err, "login event collection failed");
                return Err(err.into());
            },
        };
        self.append_events(events);
        Ok(())
    }

    async fn attestation_tick(&self) -> Result<(), WorkError> {
        let credentials = self.credentials.read().await.clone();
        let (events, result) = self
            .attestation
            .attest(&self.client, &credentials.device_token, &credentials.device_id)
            .await;
        self.append_events(events);
        if let Err(err) = result {
            warn!(error = %err, "attestation failed");
            return Err(err.into());
        }
        Ok(())
    }

    /// Appends events to the durable queue, logging rather than failing:
    /// losing an event is preferable to failing the loop that produced
    /// it.
    fn append_events(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        if let Err(err) = self.event_queue.append(events) {
            warn!(error = %err, "failed to persist events");
        }
    }
}

/// Relays the external shutdown signal into the internal cancel channel.
async fn forward_shutdown(mut shutdown: watch::Receiver<bool>, cancel: watch::Sender<bool>) {
    if !*shutdown.borrow() {
        let _ = shutdown.changed().await;
    }
    let _ = cancel.send(true);
}

fn non_zero(value: Duration, fallback: Duration) -> Duration {
    if value.is_zero() { fallback } else { value }
}
