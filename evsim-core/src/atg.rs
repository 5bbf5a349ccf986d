//! Automatic transaction generator
//!
//! Runs one loop per charging connector that starts and stops transactions
//! with randomized delays and durations, so a fleet produces traffic without
//! an operator. Each cycle draws against a configured start probability,
//! skips connectors that are already charging and tags transactions with a
//! random entry from the authorization list when one is loaded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::AtgConfig;
use crate::ocpp::types::AuthorizationStatus;
use crate::session::Session;

/// Handle to one station's transaction generator. Clones share the same
/// start/stop state.
#[derive(Clone)]
pub struct Atg {
    session: Session,
    config: AtgConfig,
    started: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl Atg {
    pub fn new(session: Session, config: AtgConfig) -> Self {
        Self {
            session,
            config,
            started: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Start the generator loops once. Later calls, including the ones a
    /// reconnect triggers, return false and change nothing.
    pub fn ensure_started(&self) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("[{}] Transaction generator already running", self.session.name());
            return false;
        }

        info!("[{}] Starting transaction generator", self.session.name());
        let atg = self.clone();
        tokio::spawn(async move {
            for connector_id in atg.session.connector_ids().await {
                let worker = atg.clone();
                tokio::spawn(async move { worker.connector_loop(connector_id).await });
            }
            if let Some(after) = atg.config.stop_after() {
                let timer = atg.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    info!(
                        "[{}] Transaction generator deadline reached after {:?}",
                        timer.session.name(),
                        after
                    );
                    timer.stop().await;
                });
            }
        });
        true
    }

    /// Stop generating and end every transaction the station still has
    /// running. A loop mid-cycle finishes its current transaction itself
    /// before it exits.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[{}] Stopping transaction generator", self.session.name());
        for transaction_id in self.session.active_transaction_ids().await {
            if let Err(e) = self.session.stop_transaction(transaction_id).await {
                warn!(
                    "[{}] StopTransaction {} on generator stop failed: {}",
                    self.session.name(),
                    transaction_id,
                    e
                );
            }
        }
    }

    async fn connector_loop(&self, connector_id: u32) {
        info!(
            "[{}] Transaction generator loop started on connector {}",
            self.session.name(),
            connector_id
        );

        loop {
            tokio::time::sleep(random_secs(
                self.config.min_delay_between_transactions,
                self.config.max_delay_between_transactions,
            ))
            .await;

            if self.is_stopped() {
                break;
            }

            if !rand::thread_rng().gen_bool(self.config.probability_of_start) {
                debug!(
                    "[{}] Connector {}: start not drawn this cycle",
                    self.session.name(),
                    connector_id
                );
                continue;
            }

            if self.session.is_connector_charging(connector_id).await {
                debug!(
                    "[{}] Connector {} busy, skipping cycle",
                    self.session.name(),
                    connector_id
                );
                continue;
            }

            let id_tag = self.session.random_authorized_tag().await;
            let started = match self.session.start_transaction(connector_id, id_tag).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(
                        "[{}] Generated StartTransaction on connector {} failed: {}",
                        self.session.name(),
                        connector_id,
                        e
                    );
                    continue;
                }
            };
            if started.id_tag_info.status != AuthorizationStatus::Accepted {
                debug!(
                    "[{}] Generated StartTransaction on connector {} declined: {:?}",
                    self.session.name(),
                    connector_id,
                    started.id_tag_info.status
                );
                continue;
            }

            let duration = random_secs(self.config.min_duration, self.config.max_duration);
            info!(
                "[{}] Connector {} charging for {:?} as transaction {}",
                self.session.name(),
                connector_id,
                duration,
                started.transaction_id
            );
            tokio::time::sleep(duration).await;

            // A remote stop may have ended it in the meantime.
            if self.session.transaction_id_on(connector_id).await == Some(started.transaction_id) {
                if let Err(e) = self.session.stop_transaction(started.transaction_id).await {
                    warn!(
                        "[{}] Generated StopTransaction {} failed: {}",
                        self.session.name(),
                        started.transaction_id,
                        e
                    );
                }
            }

            if self.is_stopped() {
                break;
            }
        }

        info!(
            "[{}] Transaction generator loop ended on connector {}",
            self.session.name(),
            connector_id
        );
    }
}

fn random_secs(min: u64, max: u64) -> Duration {
    Duration::from_secs(rand::thread_rng().gen_range(min..=max))
}
