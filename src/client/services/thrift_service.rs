use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::client::cache::ReconciliationCache;
use crate::client::chain::{describe_failure, ChainReader, ChainWriter, ReceiptStatus, ThriftCall, GENERIC_FAILURE};
use crate::client::config::ReconcilerConfig;
use crate::client::guard::{Action, ActionGuard, Decision};
use crate::client::history::{ContributionSync, HistoryStore};
use crate::client::orchestrator::{OperationKind, StepStatus, TransactionOrchestrator};
use crate::client::status::{
    derive_group_status_with_grace, derive_join_status, next_recipient, past_recipient, GroupStatus, JoinStatus,
};
use crate::common::errors::{ReconcileError, Result};
use crate::common::models::{Address, ContributionRecord, GroupSnapshot};
use crate::utils::logger::append_reconciliation_entry;

pub const PARTIAL_SUCCESS_MESSAGE: &str = "Payment succeeded but fulfillment failed, contact support";

/// Off-chain delivery that follows a confirmed payment (airtime, power
/// token). Returns whatever the provider hands back to show the user.
pub trait Fulfiller: Send + Sync {
    fn fulfill<'a>(&'a self, payment: &'a PaymentRequest, tx_hash: &'a str) -> BoxFuture<'a, anyhow::Result<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub group_id: u64,
    pub action: Action,
    #[serde(default)]
    pub user_name: String,
    /// Explicit user confirmation for irreversible actions.
    #[serde(default)]
    pub confirmed: bool,
    /// Submit even when the guard denies; the contract has the final say.
    #[serde(default)]
    pub force: bool,
}

impl ActionRequest {
    pub fn new(group_id: u64, action: Action) -> Self {
        Self { group_id, action, user_name: String::new(), confirmed: false, force: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SavingsOp {
    Deposit,
    Withdraw,
    Break,
    Approve,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavingsRequest {
    pub op: SavingsOp,
    pub token_symbol: String,
    #[serde(default)]
    pub amount: u128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub token_symbol: String,
    pub recipient: Address,
    pub amount: u128,
    /// Meter number, phone number or similar; handed to the fulfiller.
    pub reference: String,
}

#[derive(Debug, Clone)]
pub enum ActionOutcome {
    Denied { reason: String },
    NeedsConfirmation,
    Completed {
        tx_hash: Option<String>,
        snapshot: Option<Arc<GroupSnapshot>>,
        detail: Option<String>,
    },
    Failed { step: String, message: String },
    TimedOut,
    /// Money moved but the follow-up did not. Never retried automatically.
    PartialSuccess { tx_hash: String, message: String },
}

impl ActionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, ActionOutcome::Completed { .. })
    }
}

impl fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionOutcome::Denied { reason } => write!(f, "denied: {}", reason),
            ActionOutcome::NeedsConfirmation => f.write_str("needs confirmation"),
            ActionOutcome::Completed { tx_hash: Some(hash), .. } => write!(f, "completed in {}", hash),
            ActionOutcome::Completed { tx_hash: None, .. } => f.write_str("completed (nothing to submit)"),
            ActionOutcome::Failed { step, message } => write!(f, "failed at {}: {}", step, message),
            ActionOutcome::TimedOut => f.write_str("timed out"),
            ActionOutcome::PartialSuccess { tx_hash, message } => write!(f, "{} ({})", message, tx_hash),
        }
    }
}

/// Everything a group page renders, derived from one snapshot.
#[derive(Debug, Clone)]
pub struct GroupView {
    pub snapshot: Arc<GroupSnapshot>,
    pub status: GroupStatus,
    pub join: JoinStatus,
    pub next_recipient: Option<Address>,
    pub past_recipient: Option<Address>,
}

#[derive(Clone)]
enum LastRequest {
    Action(ActionRequest),
    Savings(SavingsRequest),
    Payment(PaymentRequest, Arc<dyn Fulfiller>),
}

struct Plan {
    kind: OperationKind,
    label: String,
    call: ThriftCall,
    token_symbol: Option<String>,
    amount: u128,
}

struct StepFailure {
    step: String,
    message: String,
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct ThriftService<C: ChainReader + ChainWriter> {
    chain: Arc<C>,
    cache: ReconciliationCache<C>,
    orchestrator: TransactionOrchestrator,
    guard: ActionGuard,
    config: ReconcilerConfig,
    caller: Address,
    clock: Clock,
    last: Mutex<Option<(LastRequest, bool)>>,
}

impl<C: ChainReader + ChainWriter> ThriftService<C> {
    pub fn new(chain: Arc<C>, caller: Address, config: ReconcilerConfig) -> Self {
        Self {
            cache: ReconciliationCache::new(chain.clone()),
            chain,
            orchestrator: TransactionOrchestrator::new(),
            guard: ActionGuard::new(config.start_grace_secs),
            config,
            caller,
            clock: Arc::new(Utc::now),
            last: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn caller(&self) -> &Address {
        &self.caller
    }

    pub fn cache(&self) -> &ReconciliationCache<C> {
        &self.cache
    }

    pub fn orchestrator(&self) -> &TransactionOrchestrator {
        &self.orchestrator
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn last(&self) -> MutexGuard<'_, Option<(LastRequest, bool)>> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remember(&self, request: LastRequest, outcome: &ActionOutcome) {
        let partial = matches!(outcome, ActionOutcome::PartialSuccess { .. });
        *self.last() = Some((request, partial));
    }

    /// Refreshes the group and derives everything from that one snapshot.
    pub async fn group_view(&self, group_id: u64) -> Result<GroupView> {
        let snapshot = self.cache.get_or_refresh(group_id).await?;
        let now = self.now();
        let group = snapshot.group.as_ref();
        Ok(GroupView {
            status: derive_group_status_with_grace(group, now, self.config.start_grace_secs),
            join: derive_join_status(group, snapshot.member(&self.caller), &self.caller),
            next_recipient: group.and_then(next_recipient).cloned(),
            past_recipient: group.and_then(past_recipient).cloned(),
            snapshot,
        })
    }

    /// Guard decision against the current fresh snapshot, refreshing first
    /// if there is none.
    pub async fn decide(&self, group_id: u64, action: &Action) -> Result<Decision> {
        self.cache.get_or_refresh(group_id).await?;
        Ok(self.guard.check(&self.cache, group_id, action, &self.caller, self.now()))
    }

    pub async fn perform(&self, request: ActionRequest) -> Result<ActionOutcome> {
        let outcome = self.perform_inner(&request).await?;
        self.remember(LastRequest::Action(request), &outcome);
        Ok(outcome)
    }

    async fn perform_inner(&self, request: &ActionRequest) -> Result<ActionOutcome> {
        let group_id = request.group_id;
        let snapshot = self.cache.refresh(group_id).await?;
        let decision = self.guard.check(&self.cache, group_id, &request.action, &self.caller, self.now());

        if !decision.allowed && !request.force {
            let reason = decision.reason.unwrap_or_default();
            info!("[SERVICE] {} on group {} denied: {}", request.action, group_id, reason);
            return Ok(ActionOutcome::Denied { reason });
        }
        if (decision.requires_confirmation || request.action.is_irreversible()) && !request.confirmed {
            return Ok(ActionOutcome::NeedsConfirmation);
        }
        if !decision.allowed {
            let reason = decision.reason.unwrap_or_default();
            warn!("[SERVICE] Forcing {} on group {} past guard denial: {}", request.action, group_id, reason);
        }

        let group = snapshot.group.as_ref();
        let (token_symbol, amount) = match (&request.action, group) {
            (Action::Contribute, Some(g)) => (Some(g.token_symbol.clone()), g.deposit_amount),
            _ => (None, 0),
        };
        let plan = Plan {
            kind: operation_kind(&request.action),
            label: group.map(|g| g.name.clone()).unwrap_or_else(|| format!("Group #{}", group_id)),
            call: request.action.to_call(group_id, &request.user_name),
            token_symbol,
            amount,
        };

        let outcome = self.orchestrate(plan).await;

        // any submission may have changed on-chain state, even a failed one
        self.cache.invalidate(group_id);
        match outcome {
            ActionOutcome::Completed { tx_hash, detail, .. } => {
                let snapshot = match self.cache.refresh(group_id).await {
                    Ok(s) => Some(s),
                    Err(e) => {
                        warn!("[SERVICE] Post-action refresh of group {} failed: {}", group_id, e);
                        None
                    }
                };
                Ok(ActionOutcome::Completed { tx_hash, snapshot, detail })
            }
            other => Ok(other),
        }
    }

    pub async fn savings(&self, request: SavingsRequest) -> Result<ActionOutcome> {
        let token = request.token_symbol.clone();
        let (kind, call) = match request.op {
            SavingsOp::Deposit => (
                OperationKind::Deposit,
                ThriftCall::Deposit { token_symbol: token.clone(), amount: request.amount },
            ),
            SavingsOp::Withdraw => (OperationKind::Withdraw, ThriftCall::Withdraw { token_symbol: token.clone() }),
            SavingsOp::Break => (OperationKind::Break, ThriftCall::BreakTimelock { token_symbol: token.clone() }),
            SavingsOp::Approve => (
                OperationKind::Approve,
                ThriftCall::Approve { token_symbol: token.clone(), amount: request.amount },
            ),
        };
        let amount = match request.op {
            SavingsOp::Deposit | SavingsOp::Approve => request.amount,
            SavingsOp::Withdraw | SavingsOp::Break => 0,
        };
        let outcome = self
            .orchestrate(Plan { kind, label: token.clone(), call, token_symbol: Some(token), amount })
            .await;
        self.remember(LastRequest::Savings(request), &outcome);
        Ok(outcome)
    }

    /// Pays `recipient` and then asks `fulfiller` to deliver. A confirmed
    /// payment whose delivery fails is reported as a partial success.
    pub async fn pay_utility(&self, request: PaymentRequest, fulfiller: Arc<dyn Fulfiller>) -> Result<ActionOutcome> {
        let outcome = self.pay_utility_inner(&request, fulfiller.as_ref()).await;
        self.remember(LastRequest::Payment(request, fulfiller), &outcome);
        Ok(outcome)
    }

    async fn pay_utility_inner(&self, request: &PaymentRequest, fulfiller: &dyn Fulfiller) -> ActionOutcome {
        let plan = Plan {
            kind: OperationKind::UtilityPayment,
            label: request.reference.clone(),
            call: ThriftCall::Payment {
                token_symbol: request.token_symbol.clone(),
                recipient: request.recipient.clone(),
                amount: request.amount,
                reference: request.reference.clone(),
            },
            token_symbol: Some(request.token_symbol.clone()),
            amount: request.amount,
        };
        let (run, result) = self.run_plan(&plan).await;
        let tx_hash = match result {
            Some(Ok(Some(hash))) => hash,
            Some(Ok(None)) => {
                let failed = ActionOutcome::Failed { step: "payment".to_string(), message: GENERIC_FAILURE.to_string() };
                return self.finish(run, failed);
            }
            Some(Err(f)) => return self.finish(run, ActionOutcome::Failed { step: f.step, message: f.message }),
            None => return self.finish(run, ActionOutcome::TimedOut),
        };

        self.mark(run, "fulfill", StepStatus::Loading, None);
        let delivered = tokio::time::timeout(self.config.tx_timeout, fulfiller.fulfill(request, &tx_hash)).await;
        let failure = match delivered {
            Ok(Ok(detail)) => {
                self.mark(run, "fulfill", StepStatus::Success, None);
                info!("[SERVICE] Payment {} for {} fulfilled", tx_hash, request.reference);
                let completed = ActionOutcome::Completed { tx_hash: Some(tx_hash), snapshot: None, detail: Some(detail) };
                return self.finish(run, completed);
            }
            Ok(Err(e)) => format!("{:#}", e),
            Err(_) => ReconcileError::Timeout.to_string(),
        };

        let err = ReconcileError::FulfillmentFailed { tx_hash: tx_hash.clone(), message: failure };
        error!("[SERVICE] {} (reference {})", err, request.reference);
        if let Some(path) = &self.config.reconciliation_log {
            if let Err(e) = append_reconciliation_entry(path, &tx_hash, &request.reference, &err.to_string()) {
                error!("[SERVICE] Could not record {} in {}: {}", tx_hash, path.display(), e);
            }
        }
        self.mark(run, "fulfill", StepStatus::Error, Some(PARTIAL_SUCCESS_MESSAGE.to_string()));
        self.finish(run, ActionOutcome::PartialSuccess { tx_hash, message: PARTIAL_SUCCESS_MESSAGE.to_string() })
    }

    /// Runs the last request again from its first step. A partial success is
    /// never retried: the payment already went through.
    pub async fn retry(&self) -> Result<ActionOutcome> {
        let last = self.last().clone();
        match last {
            None => Ok(ActionOutcome::Denied { reason: "nothing to retry".to_string() }),
            Some((_, true)) => Ok(ActionOutcome::Denied {
                reason: "payment already went through; contact support instead of retrying".to_string(),
            }),
            Some((LastRequest::Action(request), false)) => self.perform(request).await,
            Some((LastRequest::Savings(request), false)) => self.savings(request).await,
            Some((LastRequest::Payment(request, fulfiller), false)) => self.pay_utility(request, fulfiller).await,
        }
    }

    pub async fn contribution_history<S: HistoryStore>(
        &self,
        sync: &ContributionSync<C, S>,
        group_id: u64,
        force: bool,
    ) -> Result<Vec<ContributionRecord>> {
        let snapshot = self.cache.get_or_refresh(group_id).await?;
        let group = snapshot.group.as_ref().ok_or(ReconcileError::GroupNotFound(group_id))?;
        sync.sync(group_id, &group.token_symbol, force).await
    }

    async fn orchestrate(&self, plan: Plan) -> ActionOutcome {
        let (run, result) = self.run_plan(&plan).await;
        let outcome = match result {
            Some(Ok(tx_hash)) => ActionOutcome::Completed { tx_hash, snapshot: None, detail: None },
            Some(Err(f)) => ActionOutcome::Failed { step: f.step, message: f.message },
            None => ActionOutcome::TimedOut,
        };
        self.finish(run, outcome)
    }

    /// Opens the dialog and drives the chain steps under the timeout.
    /// `None` means the timeout fired.
    async fn run_plan(&self, plan: &Plan) -> (Uuid, Option<std::result::Result<Option<String>, StepFailure>>) {
        let run = self.orchestrator.open_dialog(plan.kind, &plan.label);
        self.orchestrator.set_waiting(run, true);
        info!("[SERVICE] {} by {} ({})", plan.call.method(), self.caller.short(), plan.label);

        match tokio::time::timeout(self.config.tx_timeout, self.execute(run, plan)).await {
            Ok(result) => (run, Some(result)),
            Err(_) => {
                self.orchestrator.enforce_timeout(run);
                warn!("[SERVICE] {} timed out after {:?}", plan.call.method(), self.config.tx_timeout);
                (run, None)
            }
        }
    }

    fn finish(&self, run: Uuid, outcome: ActionOutcome) -> ActionOutcome {
        self.orchestrator.set_waiting(run, false);
        self.orchestrator.schedule_auto_close(run, self.config.auto_close_delay);
        debug!("[SERVICE] Run {} finished: {}", run, outcome);
        outcome
    }

    fn mark(&self, run: Uuid, step: &str, status: StepStatus, message: Option<String>) {
        if let Err(e) = self.orchestrator.update_step(run, step, status, message) {
            warn!("[SERVICE] {}", e);
        }
    }

    fn fail(&self, run: Uuid, step: &str, message: String) -> StepFailure {
        self.mark(run, step, StepStatus::Error, Some(message.clone()));
        StepFailure { step: step.to_string(), message }
    }

    async fn execute(&self, run: Uuid, plan: &Plan) -> std::result::Result<Option<String>, StepFailure> {
        let steps: Vec<String> = self.orchestrator.steps().into_iter().map(|s| s.id).collect();
        let has = |id: &str| steps.iter().any(|s| s == id);

        if has("check-balance") {
            self.check_balance(run, plan).await?;
        }

        if let (true, Some(token)) = (has("approve"), &plan.token_symbol) {
            let sufficient = if has("allowance") {
                self.mark(run, "allowance", StepStatus::Loading, None);
                let allowance = self
                    .chain
                    .allowance(&self.caller, token)
                    .await
                    .map_err(|e| self.fail(run, "allowance", describe_failure(&format!("{:#}", e))))?;
                self.mark(run, "allowance", StepStatus::Success, None);
                allowance >= plan.amount
            } else {
                false
            };

            if sufficient {
                debug!("[SERVICE] Allowance covers {} {}; skipping approve", plan.amount, token);
                self.mark(run, "approve", StepStatus::Success, None);
                if plan.kind == OperationKind::Approve {
                    self.mark(run, "confirm", StepStatus::Success, None);
                    return Ok(None);
                }
            } else if plan.kind != OperationKind::Approve {
                self.approve(run, token, plan.amount).await?;
            }
        }

        let submit = plan.kind.submit_step();
        self.mark(run, submit, StepStatus::Loading, None);
        let tx = self
            .chain
            .submit(&self.caller, &plan.call)
            .await
            .map_err(|e| self.fail(run, submit, describe_failure(&format!("{:#}", e))))?;
        self.mark(run, submit, StepStatus::Success, None);

        self.mark(run, "confirm", StepStatus::Loading, None);
        let receipt = self
            .chain
            .wait_for_receipt(&tx)
            .await
            .map_err(|e| self.fail(run, "confirm", describe_failure(&format!("{:#}", e))))?;
        if receipt.status == ReceiptStatus::Reverted {
            let reason = receipt.revert_reason.unwrap_or_else(|| GENERIC_FAILURE.to_string());
            warn!("[SERVICE] {} {}", tx.hash, ReconcileError::Reverted(reason.clone()));
            return Err(self.fail(run, "confirm", reason));
        }
        self.mark(run, "confirm", StepStatus::Success, None);
        info!("[SERVICE] {} confirmed in block {}", tx.hash, receipt.block_number);
        Ok(Some(tx.hash))
    }

    async fn check_balance(&self, run: Uuid, plan: &Plan) -> std::result::Result<(), StepFailure> {
        self.mark(run, "check-balance", StepStatus::Loading, None);
        let token = match &plan.token_symbol {
            Some(t) => t,
            None => {
                self.mark(run, "check-balance", StepStatus::Success, None);
                return Ok(());
            }
        };
        let balance = self
            .chain
            .token_balance(&self.caller, token)
            .await
            .map_err(|e| self.fail(run, "check-balance", describe_failure(&format!("{:#}", e))))?;
        if balance < plan.amount {
            return Err(self.fail(run, "check-balance", format!("Insufficient {} balance", token)));
        }
        self.mark(run, "check-balance", StepStatus::Success, None);
        Ok(())
    }

    async fn approve(&self, run: Uuid, token: &str, amount: u128) -> std::result::Result<(), StepFailure> {
        self.mark(run, "approve", StepStatus::Loading, None);
        let call = ThriftCall::Approve { token_symbol: token.to_string(), amount };
        let tx = self
            .chain
            .submit(&self.caller, &call)
            .await
            .map_err(|e| self.fail(run, "approve", describe_failure(&format!("{:#}", e))))?;
        let receipt = self
            .chain
            .wait_for_receipt(&tx)
            .await
            .map_err(|e| self.fail(run, "approve", describe_failure(&format!("{:#}", e))))?;
        if receipt.status == ReceiptStatus::Reverted {
            let reason = receipt.revert_reason.unwrap_or_else(|| GENERIC_FAILURE.to_string());
            return Err(self.fail(run, "approve", reason));
        }
        self.mark(run, "approve", StepStatus::Success, None);
        Ok(())
    }
}

fn operation_kind(action: &Action) -> OperationKind {
    match action {
        Action::Join => OperationKind::Join,
        Action::Contribute => OperationKind::Contribute,
        Action::Activate => OperationKind::Activate,
        Action::Distribute => OperationKind::Distribute,
        Action::SetPayoutOrder { .. } => OperationKind::SetPayoutOrder,
        Action::AddMember { .. } => OperationKind::AddMember,
        Action::EmergencyWithdraw => OperationKind::EmergencyWithdraw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::history::MemoryHistoryStore;
    use crate::client::services::memory_chain::MemoryChain;
    use futures_util::FutureExt;
    use std::time::Duration;

    fn addr(n: u8) -> Address {
        Address::parse(&format!("0x{}", format!("{:02x}", n).repeat(20))).unwrap()
    }

    fn service(chain: &Arc<MemoryChain>, who: u8) -> ThriftService<MemoryChain> {
        let clock = chain.clone();
        ThriftService::new(chain.clone(), addr(who), ReconcilerConfig::default()).with_clock(move || clock.now())
    }

    /// Three members, payout order 2, 3, 1, everybody funded.
    fn ready_group(chain: &Arc<MemoryChain>) -> u64 {
        let admin = addr(1);
        let id = chain.create_group(&admin, "Market circle", 50, "cUSD", 3, true);
        for n in [2, 3] {
            chain.execute(&addr(n), &ThriftCall::Join { group_id: id, user_name: format!("m{}", n) }).unwrap();
        }
        for n in [1, 2, 3] {
            chain.mint(&addr(n), "cUSD", 1_000);
        }
        chain
            .execute(&admin, &ThriftCall::SetPayoutOrder { group_id: id, order: vec![addr(2), addr(3), addr(1)] })
            .unwrap();
        id
    }

    struct Provider {
        fail: bool,
    }

    impl Fulfiller for Provider {
        fn fulfill<'a>(&'a self, payment: &'a PaymentRequest, _tx_hash: &'a str) -> BoxFuture<'a, anyhow::Result<String>> {
            async move {
                if self.fail {
                    anyhow::bail!("provider returned 503");
                }
                Ok(format!("TOKEN-{}", payment.reference))
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn full_rotation_advances_payouts_one_at_a_time() {
        let chain = Arc::new(MemoryChain::new());
        let id = ready_group(&chain);
        let services: Vec<_> = [1, 2, 3].into_iter().map(|n| service(&chain, n)).collect();

        let activated = services[0].perform(ActionRequest::new(id, Action::Activate)).await.unwrap();
        assert!(activated.is_completed(), "{}", activated);

        let mut last_payouts = 0;
        for round in 0..3 {
            for svc in &services {
                let out = svc.perform(ActionRequest::new(id, Action::Contribute)).await.unwrap();
                assert!(out.is_completed(), "round {}: {}", round, out);
            }
            let out = services[0].perform(ActionRequest::new(id, Action::Distribute)).await.unwrap();
            let payouts = match out {
                ActionOutcome::Completed { snapshot: Some(s), .. } => s.group.as_ref().unwrap().completed_payouts,
                other => panic!("distribute failed: {}", other),
            };
            assert_eq!(payouts, last_payouts + 1);
            last_payouts = payouts;
        }

        let view = services[0].group_view(id).await.unwrap();
        assert!(!view.status.is_active);
        assert_eq!(view.past_recipient, Some(addr(1)));
        for n in [1, 2, 3] {
            assert_eq!(chain.balance_of(&addr(n), "cUSD"), 1_000);
        }
    }

    #[tokio::test]
    async fn activate_without_payout_order() {
        let chain = Arc::new(MemoryChain::new());
        let admin = addr(1);
        let id = chain.create_group(&admin, "Circle", 50, "cUSD", 5, true);
        for n in 2..=5 {
            chain.execute(&addr(n), &ThriftCall::Join { group_id: id, user_name: String::new() }).unwrap();
        }
        let svc = service(&chain, 1);

        let denied = svc.perform(ActionRequest::new(id, Action::Activate)).await.unwrap();
        match denied {
            ActionOutcome::Denied { reason } => assert_eq!(reason, "payout order not set"),
            other => panic!("expected denial, got {}", other),
        }

        let mut forced = ActionRequest::new(id, Action::Activate);
        forced.force = true;
        let out = svc.perform(forced).await.unwrap();
        match out {
            ActionOutcome::Failed { step, message } => {
                assert_eq!(step, "activate");
                assert!(message.contains("Payout order not set"), "{}", message);
            }
            other => panic!("expected failure, got {}", other),
        }
        let steps = svc.orchestrator().steps();
        assert_eq!(steps[0].status, StepStatus::Error);
        assert_eq!(steps[1].status, StepStatus::Inactive);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_receipt_times_out_without_loading_steps() {
        let chain = Arc::new(MemoryChain::new());
        let id = ready_group(&chain);
        let svc = service(&chain, 1);
        svc.perform(ActionRequest::new(id, Action::Activate)).await.unwrap();

        chain.hang_receipts(true);
        let out = svc.perform(ActionRequest::new(id, Action::Contribute)).await.unwrap();
        assert!(matches!(out, ActionOutcome::TimedOut));

        let view = svc.orchestrator().view();
        assert!(view.steps.iter().all(|s| s.status != StepStatus::Loading));
        assert!(view.has_error && !view.is_waiting_tx);
        assert!(view
            .steps
            .iter()
            .any(|s| s.error_message.as_deref() == Some(crate::client::orchestrator::TIMEOUT_MESSAGE)));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!svc.orchestrator().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_receipt_inside_timeout_completes() {
        let chain = Arc::new(MemoryChain::new());
        let id = ready_group(&chain);
        let svc = service(&chain, 1);
        svc.perform(ActionRequest::new(id, Action::Activate)).await.unwrap();

        chain.set_receipt_latency(Duration::from_secs(30));
        let out = svc.perform(ActionRequest::new(id, Action::Contribute)).await.unwrap();
        assert!(out.is_completed(), "{}", out);
        assert!(svc.orchestrator().all_steps_completed());
    }

    #[tokio::test]
    async fn existing_allowance_skips_approve() {
        let chain = Arc::new(MemoryChain::new());
        let id = ready_group(&chain);
        let svc = service(&chain, 1);
        svc.perform(ActionRequest::new(id, Action::Activate)).await.unwrap();
        chain.execute(&addr(1), &ThriftCall::Approve { token_symbol: "cUSD".into(), amount: 500 }).unwrap();

        let out = svc.perform(ActionRequest::new(id, Action::Contribute)).await.unwrap();
        assert!(out.is_completed());
        assert!(svc.orchestrator().all_steps_completed());
    }

    #[tokio::test]
    async fn contribution_before_activation_is_denied() {
        let chain = Arc::new(MemoryChain::new());
        let id = ready_group(&chain);
        let out = service(&chain, 2).perform(ActionRequest::new(id, Action::Contribute)).await.unwrap();
        match out {
            ActionOutcome::Denied { reason } => assert_eq!(reason, "group not active"),
            other => panic!("{}", other),
        }
    }

    #[tokio::test]
    async fn emergency_withdraw_waits_for_confirmation() {
        let chain = Arc::new(MemoryChain::new());
        let id = ready_group(&chain);
        let svc = service(&chain, 1);
        let out = svc.perform(ActionRequest::new(id, Action::EmergencyWithdraw)).await.unwrap();
        assert!(matches!(out, ActionOutcome::NeedsConfirmation));

        let mut confirmed = ActionRequest::new(id, Action::EmergencyWithdraw);
        confirmed.confirmed = true;
        assert!(svc.perform(confirmed).await.unwrap().is_completed());
    }

    #[tokio::test]
    async fn forced_emergency_withdraw_still_needs_confirmation() {
        let chain = Arc::new(MemoryChain::new());
        let id = ready_group(&chain);
        let before = chain.balance_of(&addr(2), "cUSD");

        // denied for a non-admin, and force does not skip the confirmation
        let outsider = service(&chain, 2);
        let mut forced = ActionRequest::new(id, Action::EmergencyWithdraw);
        forced.force = true;
        let out = outsider.perform(forced.clone()).await.unwrap();
        assert!(matches!(out, ActionOutcome::NeedsConfirmation), "{}", out);
        assert!(outsider.orchestrator().steps().is_empty());

        // confirmed and forced reaches the contract, which rejects it
        forced.confirmed = true;
        let out = outsider.perform(forced).await.unwrap();
        assert!(matches!(out, ActionOutcome::Failed { .. }), "{}", out);
        assert_eq!(chain.balance_of(&addr(2), "cUSD"), before);

        let admin = service(&chain, 1);
        let mut unconfirmed = ActionRequest::new(id, Action::EmergencyWithdraw);
        unconfirmed.force = true;
        assert!(matches!(admin.perform(unconfirmed).await.unwrap(), ActionOutcome::NeedsConfirmation));
    }

    #[tokio::test]
    async fn reverted_receipt_is_decoded_and_retry_starts_over() {
        let chain = Arc::new(MemoryChain::new());
        let id = ready_group(&chain);
        let svc = service(&chain, 1);

        chain.revert_next_receipt("Out of gas");
        let out = svc.perform(ActionRequest::new(id, Action::Activate)).await.unwrap();
        match out {
            ActionOutcome::Failed { step, message } => {
                assert_eq!(step, "confirm");
                assert_eq!(message, "Out of gas");
            }
            other => panic!("{}", other),
        }

        let retried = svc.retry().await.unwrap();
        assert!(retried.is_completed(), "{}", retried);
        assert!(svc.orchestrator().all_steps_completed());
    }

    #[tokio::test]
    async fn failed_fulfillment_is_partial_success_and_not_retried() {
        let chain = Arc::new(MemoryChain::new());
        let payer = addr(1);
        chain.mint(&payer, "cUSD", 100);
        let svc = service(&chain, 1);
        let request = PaymentRequest {
            token_symbol: "cUSD".into(),
            recipient: addr(7),
            amount: 40,
            reference: "meter-0042".into(),
        };

        let out = svc.pay_utility(request.clone(), Arc::new(Provider { fail: true })).await.unwrap();
        match &out {
            ActionOutcome::PartialSuccess { message, .. } => assert_eq!(message, PARTIAL_SUCCESS_MESSAGE),
            other => panic!("{}", other),
        }
        assert_eq!(chain.balance_of(&payer, "cUSD"), 60);

        match svc.retry().await.unwrap() {
            ActionOutcome::Denied { .. } => {}
            other => panic!("partial success was retried: {}", other),
        }
        assert_eq!(chain.balance_of(&payer, "cUSD"), 60);

        let ok = svc.pay_utility(request, Arc::new(Provider { fail: false })).await.unwrap();
        match ok {
            ActionOutcome::Completed { detail, .. } => assert_eq!(detail.as_deref(), Some("TOKEN-meter-0042")),
            other => panic!("{}", other),
        }
    }

    #[tokio::test]
    async fn savings_deposit_and_withdraw() {
        let chain = Arc::new(MemoryChain::new());
        let me = addr(4);
        chain.mint(&me, "cUSD", 100);
        let svc = service(&chain, 4);

        let deposit = SavingsRequest { op: SavingsOp::Deposit, token_symbol: "cUSD".into(), amount: 70 };
        assert!(svc.savings(deposit).await.unwrap().is_completed());
        assert_eq!(chain.savings_of(&me, "cUSD"), 70);

        let too_much = SavingsRequest { op: SavingsOp::Deposit, token_symbol: "cUSD".into(), amount: 70 };
        match svc.savings(too_much).await.unwrap() {
            ActionOutcome::Failed { step, message } => {
                assert_eq!(step, "check-balance");
                assert_eq!(message, "Insufficient cUSD balance");
            }
            other => panic!("{}", other),
        }

        let withdraw = SavingsRequest { op: SavingsOp::Withdraw, token_symbol: "cUSD".into(), amount: 0 };
        assert!(svc.savings(withdraw).await.unwrap().is_completed());
        assert_eq!(chain.balance_of(&me, "cUSD"), 100);
    }

    #[tokio::test]
    async fn history_through_service() {
        let chain = Arc::new(MemoryChain::new());
        let id = ready_group(&chain);
        let svc = service(&chain, 1);
        svc.perform(ActionRequest::new(id, Action::Activate)).await.unwrap();
        svc.perform(ActionRequest::new(id, Action::Contribute)).await.unwrap();

        let sync = ContributionSync::new(chain.clone(), Arc::new(MemoryHistoryStore::new()), &ReconcilerConfig::default());
        let history = svc.contribution_history(&sync, id, false).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].member, addr(1));
        assert_eq!(history[0].amount, 50);

        let missing = svc.contribution_history(&sync, 99, false).await.unwrap_err();
        assert_eq!(missing, ReconcileError::GroupNotFound(99));
    }
}
