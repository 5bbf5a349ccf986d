//! Station assembly
//!
//! Materializes one simulated station from the fleet configuration: loads
//! and watches the authorization list, builds the session and wires in the
//! transaction generator when it is enabled.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::atg::Atg;
use crate::authorization::AuthorizationList;
use crate::config::FleetConfig;
use crate::session::Session;
use crate::stats::StatisticsSink;

/// One simulated charging station.
pub struct Station {
    session: Session,
    watcher: Option<JoinHandle<()>>,
}

impl Station {
    /// Materialize station `index` (1-based) from the fleet configuration.
    pub async fn new(index: u32, config: &FleetConfig, stats: Arc<dyn StatisticsSink>) -> Self {
        let info = config.station_info(index);

        let (authorized_tags, watcher) = match info.authorization_file.as_ref() {
            Some(path) => {
                let list = AuthorizationList::load(path).await;
                let watcher = list.watch(path.clone());
                (list, Some(watcher))
            }
            None => (AuthorizationList::new(), None),
        };

        let session = Session::new(info, authorized_tags, stats);
        if session.info().atg.enable {
            let atg = Atg::new(session.clone(), session.info().atg.clone());
            session.attach_atg(atg).await;
        }

        Self { session, watcher }
    }

    pub fn name(&self) -> &str {
        self.session.name()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Run the station until its task is dropped.
    pub async fn run(self) {
        info!("[{}] Station starting", self.session.name());
        self.session.run().await;
    }
}

impl Drop for Station {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}
