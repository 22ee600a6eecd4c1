use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bootstrapper::Bootstrapper;
use crate::controller::PartitionController;
use crate::error::{Error, Result};
use crate::lease::LeaseStore;
use crate::load_balancer::LoadBalancer;

enum State {
    Idle,
    Running {
        cancel: CancellationToken,
        balancer: JoinHandle<Result<()>>,
    },
    Stopped,
}

/// Start/stop lifecycle of one worker: bootstrap the lease store, re-adopt
/// owned leases, then keep balancing until stopped. A stopped manager cannot
/// be started again.
pub struct PartitionManager {
    bootstrapper: Bootstrapper,
    controller: PartitionController,
    balancer: Arc<LoadBalancer>,
    lease_store: Arc<LeaseStore>,
    state: Mutex<State>,
}

impl PartitionManager {
    pub fn new(
        bootstrapper: Bootstrapper,
        controller: PartitionController,
        balancer: Arc<LoadBalancer>,
        lease_store: Arc<LeaseStore>,
    ) -> Self {
        Self {
            bootstrapper,
            controller,
            balancer,
            lease_store,
            state: Mutex::new(State::Idle),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match *state {
            State::Idle => {}
            State::Running { .. } => {
                return Err(Error::invalid_state("partition manager already started"))
            }
            State::Stopped => return Err(Error::invalid_state("partition manager was stopped")),
        }

        let cancel = CancellationToken::new();
        self.bootstrapper.initialize(&cancel).await?;
        self.controller.initialize().await?;

        let balancer = {
            let balancer = Arc::clone(&self.balancer);
            let token = cancel.child_token();
            tokio::spawn(async move { balancer.run(token).await })
        };

        *state = State::Running { cancel, balancer };
        info!("partition manager started");
        Ok(())
    }

    /// Stop balancing, stop every supervisor (releasing its lease) and drop
    /// this worker's presence record. Returns once all of it has finished.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let State::Running { cancel, balancer } = std::mem::replace(&mut *state, State::Stopped)
        else {
            return Ok(());
        };

        cancel.cancel();
        match balancer_outcome(balancer.await) {
            Ok(()) => {}
            Err(e @ Error::Join(_)) => error!(error = %e, "load balancer task failed"),
            Err(e) => warn!(error = %e, "load balancer exited with an error"),
        }

        self.controller.shutdown().await;
        self.lease_store.unregister_worker().await?;
        info!("partition manager stopped");
        Ok(())
    }
}

fn balancer_outcome(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    joined?
}
