//! Registration Client
//!
//! Advertises this node under its service role and keeps the advertisement
//! alive:
//! - `start()` publishes the record under a fresh lease. Failure here is
//!   fatal, a node nobody can find must not serve.
//! - the renewal loop sends a keep-alive every `keepalive_interval`. Failed
//!   rounds are retried with exponential backoff and never abandoned. A lease
//!   the registry no longer knows is replaced by publishing again.
//! - `exit()` stops the loop and withdraws the record. It is idempotent and
//!   safe on a client that never started.

use crate::config::PusherConfig;
use crate::lifecycle::Component;
use crate::observability::{events, metrics};
use crate::registry::{Lease, Registry, RegistryError};
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use liteim_core::RegistrationRecord;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("initial registration failed: {0}")]
    Publish(#[source] RegistryError),
    #[error("registration client already started")]
    AlreadyStarted,
    #[error("withdrawing registration failed: {0}")]
    Withdraw(#[source] RegistryError),
    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),
}

/// State shared between the client handle and its renewal loop
struct Shared {
    registry: Arc<dyn Registry>,
    record: RegistrationRecord,
    lease_ttl: Duration,
    lease: Mutex<Option<Lease>>,
    registered: Arc<AtomicBool>,
}

impl Shared {
    fn current_lease(&self) -> Option<Lease> {
        *self.lease.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_lease(&self, lease: Option<Lease>) {
        *self.lease.lock().unwrap_or_else(|e| e.into_inner()) = lease;
    }

    fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::SeqCst);
        metrics::set_registered(registered);
    }

    async fn publish(&self) -> Result<Lease, RegistryError> {
        let lease = self.registry.publish(&self.record, self.lease_ttl).await?;
        self.set_lease(Some(lease));
        self.set_registered(true);
        Ok(lease)
    }

    /// One keep-alive round. A lost lease is restored by publishing again.
    async fn renew_once(&self) -> Result<(), RegistryError> {
        let result = match self.current_lease() {
            Some(lease) => self.registry.renew(&lease).await,
            None => Err(RegistryError::LeaseNotFound(0)),
        };

        match result {
            Ok(()) => {
                metrics::record_renewal(true);
                self.set_registered(true);
                Ok(())
            }
            Err(e) if e.is_lease_lost() => {
                metrics::record_renewal(false);
                self.set_registered(false);
                warn!(error = %e, "Registration lease lost, publishing again");

                let lease = self.publish().await?;
                metrics::record_registration_restored();
                events::registration_restored(&self.record.role, &self.record.address, lease.id);
                Ok(())
            }
            Err(e) => {
                metrics::record_renewal(false);
                self.set_registered(false);
                Err(e)
            }
        }
    }
}

/// Keeps this node's registration alive in the registry
pub struct RegistrationClient {
    shared: Arc<Shared>,
    keepalive_interval: Duration,
    initial_backoff: ExponentialBackoff,
    renewal_backoff: ExponentialBackoff,
    exit_timeout: Duration,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    exited: AtomicBool,
}

impl RegistrationClient {
    pub fn new(
        registry: Arc<dyn Registry>,
        record: RegistrationRecord,
        config: &PusherConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                record,
                lease_ttl: config.lease_ttl,
                lease: Mutex::new(None),
                registered: Arc::new(AtomicBool::new(false)),
            }),
            keepalive_interval: config.keepalive_interval,
            initial_backoff: config.retry_backoff(Some(config.connect_max_elapsed)),
            renewal_backoff: config.retry_backoff(None),
            exit_timeout: config.exit_timeout,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            started: AtomicBool::new(false),
            exited: AtomicBool::new(false),
        }
    }

    pub fn record(&self) -> &RegistrationRecord {
        &self.shared.record
    }

    /// Whether the registry currently holds a live registration for this node
    pub fn is_registered(&self) -> bool {
        self.shared.registered.load(Ordering::SeqCst)
    }

    /// Shared flag tracking `is_registered`, for readiness probes
    pub fn registered_flag(&self) -> Arc<AtomicBool> {
        self.shared.registered.clone()
    }

    pub fn lease(&self) -> Option<Lease> {
        self.shared.current_lease()
    }

    /// Publish the registration and spawn the renewal loop.
    ///
    /// Publishing is retried with backoff for at most `connect_max_elapsed`
    /// before giving up.
    pub async fn start(&self) -> Result<(), RegistrationError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RegistrationError::AlreadyStarted);
        }

        let shared = &self.shared;
        let lease = retry(self.initial_backoff.clone(), || async move {
            shared.publish().await.map_err(|e| {
                warn!(error = %e, "Initial registration failed, retrying");
                backoff::Error::transient(e)
            })
        })
        .await
        .map_err(RegistrationError::Publish)?;

        events::node_registered(&shared.record.role, &shared.record.address, lease.id);

        let handle = tokio::spawn(run(
            self.shared.clone(),
            self.keepalive_interval,
            self.renewal_backoff.clone(),
            self.cancel.clone(),
        ));
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Stop renewing and withdraw the registration.
    pub async fn exit(&self) -> Result<(), RegistrationError> {
        if self.exited.swap(true, Ordering::SeqCst) {
            debug!("Registration client already exited");
            return Ok(());
        }

        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut task) = task {
            if tokio::time::timeout(self.exit_timeout, &mut task).await.is_err() {
                task.abort();
                warn!("Renewal loop did not stop in time, aborted");
            }
        }

        let Some(lease) = self.shared.current_lease() else {
            debug!("Never registered, nothing to withdraw");
            return Ok(());
        };

        let record = &self.shared.record;
        let withdraw = self
            .shared
            .registry
            .withdraw(&record.role, &record.address, Some(&lease));
        let result = match tokio::time::timeout(self.exit_timeout, withdraw).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RegistrationError::Withdraw(e)),
            Err(_) => Err(RegistrationError::Timeout("withdraw", self.exit_timeout)),
        };

        // Whatever happened, this process no longer vouches for the record.
        // An unrevoked lease expires on its own.
        self.shared.set_lease(None);
        self.shared.set_registered(false);
        if result.is_ok() {
            events::node_deregistered(&record.role, &record.address);
        }
        result
    }
}

/// Renewal loop. Returns only when cancelled.
async fn run(
    shared: Arc<Shared>,
    keepalive_interval: Duration,
    backoff: ExponentialBackoff,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(keepalive_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // Skip first immediate tick

    info!(
        interval = ?keepalive_interval,
        address = %shared.record.address,
        "Registration renewal loop started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let shared = &shared;
        let round = retry(backoff.clone(), || async move {
            shared.renew_once().await.map_err(|e| {
                warn!(error = %e, "Registration renewal failed, retrying");
                backoff::Error::transient(e)
            })
        });

        tokio::select! {
            _ = cancel.cancelled() => break,
            result = round => {
                // Unbounded backoff only returns once a round succeeds
                if let Err(e) = result {
                    warn!(error = %e, "Registration renewal gave up");
                }
            }
        }
    }

    debug!("Registration renewal loop stopped");
}

#[async_trait]
impl Component for RegistrationClient {
    fn name(&self) -> &'static str {
        "registration"
    }

    fn exit_timeout(&self) -> Duration {
        // Waiting for the loop, then the withdraw call
        self.exit_timeout * 2
    }

    async fn exit(&self) -> anyhow::Result<()> {
        RegistrationClient::exit(self).await.map_err(Into::into)
    }
}
