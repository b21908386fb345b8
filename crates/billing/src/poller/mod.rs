//! Client poller / retry controller
//!
//! Drives a single payment attempt from submission to a settled entitlement:
//!
//! ```text
//! idle -> submitting -> confirming -> succeeded
//!                                  -> buffering -> retrying
//!                                  -> failed
//! ```
//!
//! The controller is cooperative: nothing runs in the background. Callers
//! feed it events (`submit`, `poll`, `on_visibility_regained`, `retry`,
//! `cancel`) and [`driver::drive_until_settled`] wires the timer and the
//! visibility signal together. The buffering window is a soft timeout; it
//! only changes what the member is offered next.

pub mod attempt;
pub mod driver;
pub mod http;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;
use wedmatch_shared::PlanKind;

use crate::error::{BillingError, BillingResult};
use crate::reconcile::{ReconcileOutcome, ReconcileRequest};

pub use attempt::{AttemptStorage, FileAttemptStorage, MemoryAttemptStorage, PaymentAttempt};

/// Provider statuses that mean the charge will not complete without new
/// payment details
const TERMINAL_PENDING_STATUSES: &[&str] =
    &["requires_payment_method", "canceled", "incomplete_expired"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    /// How long unconfirmed charges show progress before a retry is offered
    pub buffer_window: Duration,
    /// Interval between background polls while buffering
    pub poll_interval: Duration,
    /// Unconfirmed polls before resolving optimistically
    pub max_polls: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            buffer_window: Duration::from_secs(120),
            poll_interval: Duration::from_secs(2),
            max_polls: 10,
        }
    }
}

/// The plan the member picked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSelection {
    pub plan: PlanKind,
    /// Price as shown, e.g. "$9.99/month"
    pub plan_price: String,
}

impl PlanSelection {
    pub fn new(plan: PlanKind, plan_price: impl Into<String>) -> Self {
        Self {
            plan,
            plan_price: plan_price.into(),
        }
    }
}

/// What a submission produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedCharge {
    pub is_subscription: bool,
    pub payment_intent_id: Option<String>,
    pub subscription_id: Option<String>,
    pub customer_id: Option<String>,
    pub price_id: Option<String>,
    /// Payment status reported right after confirmation
    pub status: String,
}

/// Creates and confirms a charge with the provider
#[async_trait]
pub trait ChargeSubmitter: Send + Sync {
    async fn submit(&self, user_id: Uuid, selection: &PlanSelection)
        -> BillingResult<SubmittedCharge>;
}

/// Asks the billing backend to reconcile a charge
#[async_trait]
pub trait ReconcileClient: Send + Sync {
    async fn reconcile(&self, request: &ReconcileRequest) -> BillingResult<ReconcileOutcome>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Submitting,
    Confirming,
    Buffering,
    Retrying,
    /// `optimistic` is set when polling gave up before confirmation
    Succeeded { optimistic: bool },
    Failed { message: String },
}

impl PollerState {
    /// Still waiting on the provider
    pub fn is_in_flight(&self) -> bool {
        matches!(self, PollerState::Confirming | PollerState::Buffering)
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, PollerState::Succeeded { .. } | PollerState::Failed { .. })
    }
}

/// User-facing text for an error raised while paying
fn failure_message(err: &BillingError) -> String {
    match err {
        BillingError::CardDeclined { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

pub struct PaymentPoller {
    user_id: Uuid,
    config: PollerConfig,
    submitter: Arc<dyn ChargeSubmitter>,
    reconciler: Arc<dyn ReconcileClient>,
    storage: Arc<dyn AttemptStorage>,
    state: PollerState,
    attempt: Option<PaymentAttempt>,
    polls: u32,
    buffer_started: Option<Instant>,
}

impl PaymentPoller {
    pub fn new(
        user_id: Uuid,
        submitter: Arc<dyn ChargeSubmitter>,
        reconciler: Arc<dyn ReconcileClient>,
        storage: Arc<dyn AttemptStorage>,
    ) -> Self {
        Self {
            user_id,
            config: PollerConfig::default(),
            submitter,
            reconciler,
            storage,
            state: PollerState::Idle,
            attempt: None,
            polls: 0,
            buffer_started: None,
        }
    }

    pub fn with_config(mut self, config: PollerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    pub fn state(&self) -> &PollerState {
        &self.state
    }

    pub fn attempt(&self) -> Option<&PaymentAttempt> {
        self.attempt.as_ref()
    }

    /// Unconfirmed polls since the last submit or retry
    pub fn polls(&self) -> u32 {
        self.polls
    }

    /// Fraction of the buffering window that has elapsed, in `0.0..=1.0`
    pub fn buffer_progress(&self) -> f64 {
        match (&self.state, self.buffer_started) {
            (PollerState::Retrying, _) => 1.0,
            (PollerState::Buffering, Some(started)) => {
                let window = self.config.buffer_window.as_secs_f64();
                if window <= 0.0 {
                    return 1.0;
                }
                (started.elapsed().as_secs_f64() / window).min(1.0)
            }
            _ => 0.0,
        }
    }

    /// Pick up an attempt persisted by an earlier session
    pub async fn resume(&mut self) -> BillingResult<PollerState> {
        if self.attempt.is_some() {
            return Ok(self.state.clone());
        }

        match self.storage.load().await? {
            Some(stored) if stored.in_progress && stored.has_reference() => {
                tracing::info!(
                    user_id = %self.user_id,
                    plan = %stored.plan_name,
                    "Resuming in-flight payment attempt"
                );
                self.attempt = Some(stored);
                self.polls = 0;
                self.state = PollerState::Confirming;
                self.check_once().await
            }
            Some(_) => {
                self.storage.clear().await?;
                Ok(self.state.clone())
            }
            None => Ok(self.state.clone()),
        }
    }

    /// Submit a new charge. An attempt already in flight is adopted instead.
    pub async fn submit(&mut self, selection: &PlanSelection) -> BillingResult<PollerState> {
        if self.state == PollerState::Submitting || self.state.is_in_flight() {
            return Ok(self.state.clone());
        }
        if self.attempt.is_some() || self.storage.load().await?.is_some() {
            tracing::warn!(
                user_id = %self.user_id,
                "Payment attempt already in flight, resuming it instead of charging again"
            );
            return self.resume_or_retry().await;
        }

        self.state = PollerState::Submitting;
        let submitted = match self.submitter.submit(self.user_id, selection).await {
            Ok(submitted) => submitted,
            Err(e) => {
                tracing::warn!(user_id = %self.user_id, error = %e, "Payment submission failed");
                self.state = PollerState::Failed {
                    message: failure_message(&e),
                };
                return Ok(self.state.clone());
            }
        };

        if TERMINAL_PENDING_STATUSES.contains(&submitted.status.as_str()) {
            self.state = PollerState::Failed {
                message: format!("Payment was not completed (status: {})", submitted.status),
            };
            return Ok(self.state.clone());
        }

        let attempt = PaymentAttempt {
            in_progress: true,
            is_subscription: submitted.is_subscription,
            payment_intent_id: submitted.payment_intent_id,
            subscription_id: submitted.subscription_id,
            customer_id: submitted.customer_id,
            price_id: submitted.price_id,
            plan_name: selection.plan.display_name().to_string(),
            plan_price: selection.plan_price.clone(),
        };
        if !attempt.has_reference() {
            self.state = PollerState::Failed {
                message: "Payment could not be started".to_string(),
            };
            return Ok(self.state.clone());
        }

        self.storage.save(&attempt).await?;
        self.attempt = Some(attempt);
        self.polls = 0;
        self.buffer_started = None;
        self.state = PollerState::Confirming;
        self.check_once().await
    }

    async fn resume_or_retry(&mut self) -> BillingResult<PollerState> {
        if self.attempt.is_none() {
            return self.resume().await;
        }
        self.retry().await
    }

    /// Timer tick: re-check the charge while it is still unconfirmed
    pub async fn poll(&mut self) -> BillingResult<PollerState> {
        if !self.state.is_in_flight() {
            return Ok(self.state.clone());
        }
        if self.window_elapsed() {
            return Ok(self.enter_retrying());
        }
        self.check_once().await
    }

    /// The member came back to the page; check right away
    pub async fn on_visibility_regained(&mut self) -> BillingResult<PollerState> {
        tracing::debug!(user_id = %self.user_id, "Visibility regained, polling");
        self.poll().await
    }

    /// Re-check the stored attempt after the buffering window ran out.
    /// Never submits a new charge.
    pub async fn retry(&mut self) -> BillingResult<PollerState> {
        if self.attempt.is_none() {
            self.attempt = self.storage.load().await?;
        }
        if self.attempt.is_none() {
            self.state = PollerState::Idle;
            return Ok(self.state.clone());
        }

        tracing::info!(user_id = %self.user_id, "Retrying confirmation of stored payment attempt");
        self.polls = 0;
        self.buffer_started = None;
        self.state = PollerState::Confirming;
        self.check_once().await
    }

    /// Forget the attempt locally. The remote charge is left to the provider.
    pub async fn cancel(&mut self) -> BillingResult<PollerState> {
        self.storage.clear().await?;
        self.attempt = None;
        self.polls = 0;
        self.buffer_started = None;
        self.state = PollerState::Idle;
        Ok(self.state.clone())
    }

    fn window_elapsed(&self) -> bool {
        self.buffer_started
            .is_some_and(|started| started.elapsed() >= self.config.buffer_window)
    }

    fn enter_retrying(&mut self) -> PollerState {
        tracing::info!(
            user_id = %self.user_id,
            polls = self.polls,
            "Payment not confirmed within buffering window, offering retry"
        );
        self.state = PollerState::Retrying;
        self.state.clone()
    }

    fn enter_buffering(&mut self) -> PollerState {
        if self.buffer_started.is_none() {
            self.buffer_started = Some(Instant::now());
        }
        if self.window_elapsed() {
            return self.enter_retrying();
        }
        self.state = PollerState::Buffering;
        self.state.clone()
    }

    async fn settle(&mut self, state: PollerState) -> BillingResult<PollerState> {
        self.storage.clear().await?;
        self.attempt = None;
        self.buffer_started = None;
        self.state = state;
        Ok(self.state.clone())
    }

    /// One reconcile call and the transition it implies
    async fn check_once(&mut self) -> BillingResult<PollerState> {
        let Some(attempt) = self.attempt.as_ref() else {
            self.state = PollerState::Idle;
            return Ok(self.state.clone());
        };
        let request = attempt.to_request(self.user_id);

        match self.reconciler.reconcile(&request).await {
            Ok(outcome) if outcome.is_success() => {
                tracing::info!(
                    user_id = %self.user_id,
                    already_processed = outcome.already_processed,
                    "Payment confirmed"
                );
                self.settle(PollerState::Succeeded { optimistic: false }).await
            }
            Ok(outcome) => {
                let status = outcome.pending_status.unwrap_or_default();
                if TERMINAL_PENDING_STATUSES.contains(&status.as_str()) {
                    return self
                        .settle(PollerState::Failed {
                            message: format!("Payment was not completed (status: {})", status),
                        })
                        .await;
                }

                self.polls += 1;
                if self.polls >= self.config.max_polls {
                    tracing::info!(
                        user_id = %self.user_id,
                        polls = self.polls,
                        "Polling limit reached, resolving optimistically"
                    );
                    return self.settle(PollerState::Succeeded { optimistic: true }).await;
                }
                Ok(self.enter_buffering())
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(user_id = %self.user_id, error = %e, "Reconcile poll failed, will retry");
                Ok(self.enter_buffering())
            }
            Err(e) => {
                tracing::warn!(user_id = %self.user_id, error = %e, "Reconcile rejected payment");
                self.settle(PollerState::Failed {
                    message: failure_message(&e),
                })
                .await
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Mutex;

    use super::*;

    /// Submitter that hands out fixed charges and counts calls
    pub struct ScriptedSubmitter {
        pub result: Mutex<Option<BillingResult<SubmittedCharge>>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedSubmitter {
        pub fn ok(charge: SubmittedCharge) -> Self {
            Self {
                result: Mutex::new(Some(Ok(charge))),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn err(err: BillingError) -> Self {
            Self {
                result: Mutex::new(Some(Err(err))),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChargeSubmitter for ScriptedSubmitter {
        async fn submit(
            &self,
            _user_id: Uuid,
            _selection: &PlanSelection,
        ) -> BillingResult<SubmittedCharge> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result
                .lock()
                .await
                .take()
                .unwrap_or_else(|| Err(BillingError::Internal("submitted twice".to_string())))
        }
    }

    /// Reconciler replaying queued answers; repeats `fallback` once drained
    pub struct ScriptedReconciler {
        pub answers: Mutex<VecDeque<BillingResult<ReconcileOutcome>>>,
        pub fallback: ReconcileOutcome,
        pub requests: Mutex<Vec<ReconcileRequest>>,
    }

    impl ScriptedReconciler {
        pub fn new(answers: Vec<BillingResult<ReconcileOutcome>>, fallback: ReconcileOutcome) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                fallback,
                requests: Mutex::new(Vec::new()),
            }
        }

        pub async fn push(&self, answer: BillingResult<ReconcileOutcome>) {
            self.answers.lock().await.push_back(answer);
        }

        pub async fn request_count(&self) -> usize {
            self.requests.lock().await.len()
        }
    }

    #[async_trait]
    impl ReconcileClient for ScriptedReconciler {
        async fn reconcile(&self, request: &ReconcileRequest) -> BillingResult<ReconcileOutcome> {
            self.requests.lock().await.push(request.clone());
            match self.answers.lock().await.pop_front() {
                Some(answer) => answer,
                None => Ok(self.fallback.clone()),
            }
        }
    }

    pub fn pending(status: &str) -> ReconcileOutcome {
        ReconcileOutcome {
            applied: false,
            already_processed: false,
            is_subscription: true,
            pending_status: Some(status.to_string()),
        }
    }

    pub fn applied() -> ReconcileOutcome {
        ReconcileOutcome {
            applied: true,
            already_processed: false,
            is_subscription: true,
            pending_status: None,
        }
    }

    pub fn subscription_charge() -> SubmittedCharge {
        SubmittedCharge {
            is_subscription: true,
            payment_intent_id: Some("pi_sub".to_string()),
            subscription_id: Some("sub_1".to_string()),
            customer_id: Some("cus_1".to_string()),
            price_id: Some("price_monthly".to_string()),
            status: "processing".to_string(),
        }
    }
}
