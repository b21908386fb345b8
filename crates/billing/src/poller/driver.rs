//! Timer and visibility wiring for [`PaymentPoller`]

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

use super::{PaymentPoller, PollerState};
use crate::error::BillingResult;

/// Signal raised by the host whenever the payment view becomes visible again
#[derive(Debug, Clone, Default)]
pub struct VisibilitySignal {
    notify: Arc<Notify>,
}

impl VisibilitySignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn regained(&self) {
        self.notify.notify_one();
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// Poll until the attempt leaves the in-flight states.
///
/// Returns `Retrying` when the buffering window runs out; the caller decides
/// whether to offer [`PaymentPoller::retry`].
pub async fn drive_until_settled(
    poller: &mut PaymentPoller,
    visibility: &VisibilitySignal,
) -> BillingResult<PollerState> {
    let mut ticker = tokio::time::interval(poller.config().poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    while poller.state().is_in_flight() {
        tokio::select! {
            _ = ticker.tick() => {
                poller.poll().await?;
            }
            _ = visibility.wait() => {
                poller.on_visibility_regained().await?;
            }
        }
    }

    Ok(poller.state().clone())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;
    use wedmatch_shared::PlanKind;

    use super::*;
    use crate::poller::testing::*;
    use crate::poller::{MemoryAttemptStorage, PlanSelection, PollerConfig};

    #[tokio::test(start_paused = true)]
    async fn test_driver_polls_until_confirmed() {
        let submitter = Arc::new(ScriptedSubmitter::ok(subscription_charge()));
        let reconciler = Arc::new(ScriptedReconciler::new(
            vec![
                Ok(pending("processing")),
                Ok(pending("processing")),
                Ok(pending("processing")),
            ],
            applied(),
        ));
        let mut poller = PaymentPoller::new(
            Uuid::new_v4(),
            submitter,
            reconciler.clone(),
            Arc::new(MemoryAttemptStorage::new()),
        );

        poller
            .submit(&PlanSelection::new(PlanKind::Monthly, "$9.99/month"))
            .await
            .unwrap();

        let state = drive_until_settled(&mut poller, &VisibilitySignal::new())
            .await
            .unwrap();

        assert_eq!(state, PollerState::Succeeded { optimistic: false });
        assert_eq!(reconciler.request_count().await, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_stops_at_buffer_window() {
        let submitter = Arc::new(ScriptedSubmitter::ok(subscription_charge()));
        let reconciler = Arc::new(ScriptedReconciler::new(vec![], pending("processing")));
        let config = PollerConfig {
            buffer_window: Duration::from_secs(5),
            poll_interval: Duration::from_secs(2),
            max_polls: 100,
        };
        let mut poller = PaymentPoller::new(
            Uuid::new_v4(),
            submitter,
            reconciler,
            Arc::new(MemoryAttemptStorage::new()),
        )
        .with_config(config);

        poller
            .submit(&PlanSelection::new(PlanKind::Premium, "$14.99/month"))
            .await
            .unwrap();

        let state = drive_until_settled(&mut poller, &VisibilitySignal::new())
            .await
            .unwrap();

        assert_eq!(state, PollerState::Retrying);
        assert!(poller.attempt().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_visibility_regain_polls_immediately() {
        let submitter = Arc::new(ScriptedSubmitter::ok(subscription_charge()));
        let reconciler = Arc::new(ScriptedReconciler::new(
            vec![Ok(pending("processing"))],
            applied(),
        ));
        let config = PollerConfig {
            poll_interval: Duration::from_secs(3600),
            ..PollerConfig::default()
        };
        let mut poller = PaymentPoller::new(
            Uuid::new_v4(),
            submitter,
            reconciler,
            Arc::new(MemoryAttemptStorage::new()),
        )
        .with_config(config);

        poller
            .submit(&PlanSelection::new(PlanKind::Monthly, "$9.99/month"))
            .await
            .unwrap();

        let visibility = VisibilitySignal::new();
        // notify_one stores a permit, so the driver sees it on its first wait
        visibility.regained();

        let started = tokio::time::Instant::now();
        let state = drive_until_settled(&mut poller, &visibility).await.unwrap();

        assert_eq!(state, PollerState::Succeeded { optimistic: false });
        assert!(started.elapsed() < Duration::from_secs(3600));
    }
}
