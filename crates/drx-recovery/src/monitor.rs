//! Health polling
//!
//! Polls the primary environment on a fixed interval and turns unhealthy or
//! failed checks into Level-1 triggers for the monitored components.

use drx_core::{
    with_timeout, DeploymentControlPlane, DrConfig, DrLevel, DrxError, IncidentTrigger,
    TriggerSource,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

pub struct HealthMonitor {
    config: DrConfig,
    control: Arc<dyn DeploymentControlPlane>,
    sink: mpsc::Sender<IncidentTrigger>,
}

impl HealthMonitor {
    pub fn new(
        config: DrConfig,
        control: Arc<dyn DeploymentControlPlane>,
        sink: mpsc::Sender<IncidentTrigger>,
    ) -> Self {
        Self {
            config,
            control,
            sink,
        }
    }

    /// Check once; the trigger sent, if any
    ///
    /// # Errors
    /// `Cancelled` when the trigger receiver is gone.
    pub async fn poll_once(&self) -> Result<Option<IncidentTrigger>, DrxError> {
        let env = &self.config.primary_env;
        let reading = with_timeout(
            "health_check",
            self.config.operation_timeout(),
            self.control.health_check(env),
        )
        .await;
        let problem = match reading {
            Ok(reading) => self.config.thresholds.violation(&reading),
            Err(err) => Some(format!("health check failed: {err}")),
        };
        let Some(reason) = problem else {
            debug!(env = %env, "primary healthy");
            return Ok(None);
        };

        warn!(env = %env, reason = %reason, "primary unhealthy");
        let trigger = IncidentTrigger::new(
            self.config.monitored_components.clone(),
            format!("{env}: {reason}"),
            TriggerSource::HealthPoll,
            DrLevel::ServiceDegradation,
        );
        self.sink
            .send(trigger.clone())
            .await
            .map_err(|_| DrxError::Cancelled)?;
        Ok(Some(trigger))
    }

    /// Poll until cancelled or the receiver goes away
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.health_poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        async {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if self.poll_once().await.is_err() {
                            break;
                        }
                    }
                }
            }
            info!("health monitor stopped");
        }
        .instrument(tracing::info_span!("health_monitor", env = %self.config.primary_env))
        .await;
    }
}
