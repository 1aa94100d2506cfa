use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::common::errors::{ReconcileError, Result};

pub const TIMEOUT_MESSAGE: &str = "Transaction timed out";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    Deposit,
    Withdraw,
    Break,
    Approve,
    Contribute,
    Join,
    Activate,
    Distribute,
    SetPayoutOrder,
    AddMember,
    EmergencyWithdraw,
    UtilityPayment,
}

impl OperationKind {
    /// `(id, title, description)` for each sub-step, in order.
    fn template(self, label: &str) -> Vec<(&'static str, String, String)> {
        let check_balance = ("check-balance", "Check balance".to_string(), format!("Checking your {} balance", label));
        let allowance = ("allowance", "Check allowance".to_string(), format!("Checking {} spending allowance", label));
        let approve = ("approve", "Approve".to_string(), format!("Approving {} for the contract", label));
        let confirm = ("confirm", "Confirm".to_string(), "Waiting for block confirmation".to_string());
        let single = |id: &'static str, title: &str, what: String| vec![(id, title.to_string(), what), confirm.clone()];

        match self {
            OperationKind::Deposit => vec![
                check_balance,
                approve,
                ("deposit", "Deposit".to_string(), format!("Depositing {} into savings", label)),
                confirm,
            ],
            OperationKind::Withdraw => vec![
                check_balance,
                ("withdraw", "Withdraw".to_string(), format!("Withdrawing {} from savings", label)),
                confirm,
            ],
            OperationKind::Break => vec![
                check_balance,
                ("break", "Break timelock".to_string(), format!("Breaking the {} timelock early", label)),
                confirm,
            ],
            OperationKind::Approve => vec![check_balance, allowance, approve, confirm],
            OperationKind::Contribute => vec![
                check_balance,
                allowance,
                approve,
                ("contribute", "Contribute".to_string(), format!("Contributing to {}", label)),
                confirm,
            ],
            OperationKind::Join => single("join", "Join group", format!("Joining {}", label)),
            OperationKind::Activate => single("activate", "Activate group", format!("Activating {}", label)),
            OperationKind::Distribute => single("distribute", "Distribute payout", format!("Paying out this round of {}", label)),
            OperationKind::SetPayoutOrder => {
                single("set-payout-order", "Set payout order", format!("Saving the payout order for {}", label))
            }
            OperationKind::AddMember => single("add-member", "Add member", format!("Adding a member to {}", label)),
            OperationKind::EmergencyWithdraw => {
                single("emergency-withdraw", "Emergency withdraw", format!("Refunding every member of {}", label))
            }
            OperationKind::UtilityPayment => vec![
                check_balance,
                ("payment", "Pay".to_string(), format!("Paying {}", label)),
                confirm,
                ("fulfill", "Deliver".to_string(), format!("Delivering {}", label)),
            ],
        }
    }

    /// Step that broadcasts the operation's main transaction.
    pub fn submit_step(self) -> &'static str {
        match self {
            OperationKind::Deposit => "deposit",
            OperationKind::Withdraw => "withdraw",
            OperationKind::Break => "break",
            OperationKind::Approve => "approve",
            OperationKind::Contribute => "contribute",
            OperationKind::Join => "join",
            OperationKind::Activate => "activate",
            OperationKind::Distribute => "distribute",
            OperationKind::SetPayoutOrder => "set-payout-order",
            OperationKind::AddMember => "add-member",
            OperationKind::EmergencyWithdraw => "emergency-withdraw",
            OperationKind::UtilityPayment => "payment",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StepStatus {
    Inactive,
    Loading,
    Success,
    Error,
}

impl StepStatus {
    pub fn can_transition(self, to: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, to),
            (Inactive, Loading) | (Inactive, Success) | (Inactive, Error) | (Loading, Success) | (Loading, Error)
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepStatus::Inactive => "inactive",
            StepStatus::Loading => "loading",
            StepStatus::Success => "success",
            StepStatus::Error => "error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionStep {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: StepStatus,
    pub error_message: Option<String>,
}

/// Read-only copy of the dialog for rendering.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DialogView {
    pub open: bool,
    pub kind: Option<OperationKind>,
    pub label: String,
    pub run_id: Uuid,
    pub steps: Vec<TransactionStep>,
    pub all_steps_completed: bool,
    pub has_error: bool,
    pub is_waiting_tx: bool,
}

struct DialogState {
    open: bool,
    kind: Option<OperationKind>,
    label: String,
    run_id: Uuid,
    steps: Vec<TransactionStep>,
    waiting: bool,
    auto_close: Option<JoinHandle<()>>,
}

impl Default for DialogState {
    fn default() -> Self {
        Self {
            open: false,
            kind: None,
            label: String::new(),
            run_id: Uuid::nil(),
            steps: Vec::new(),
            waiting: false,
            auto_close: None,
        }
    }
}

impl DialogState {
    fn all_completed(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(|s| s.status == StepStatus::Success)
    }

    fn has_error(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Error)
    }

    fn is_waiting(&self) -> bool {
        self.waiting || self.steps.iter().any(|s| s.status == StepStatus::Loading)
    }

    fn accepts(&self, run_id: Uuid) -> bool {
        self.open && self.run_id == run_id
    }

    fn cancel_auto_close(&mut self) {
        if let Some(handle) = self.auto_close.take() {
            handle.abort();
        }
    }
}

#[derive(Clone, Default)]
pub struct TransactionOrchestrator {
    state: Arc<Mutex<DialogState>>,
}

impl TransactionOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DialogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a fresh run. Every step begins inactive; updates addressed to
    /// an earlier run are ignored from here on.
    pub fn open_dialog(&self, kind: OperationKind, label: &str) -> Uuid {
        let mut state = self.lock();
        state.cancel_auto_close();
        let run_id = Uuid::new_v4();
        state.open = true;
        state.kind = Some(kind);
        state.label = label.to_string();
        state.run_id = run_id;
        state.waiting = false;
        state.steps = kind
            .template(label)
            .into_iter()
            .map(|(id, title, description)| TransactionStep {
                id: id.to_string(),
                title,
                description,
                status: StepStatus::Inactive,
                error_message: None,
            })
            .collect();
        info!("[ORCH] Opened {:?} dialog for {} (run {})", kind, label, run_id);
        run_id
    }

    /// Moves one step. Later steps are left alone when a step errors.
    pub fn update_step(
        &self,
        run_id: Uuid,
        step_id: &str,
        status: StepStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        let mut state = self.lock();
        if !state.accepts(run_id) {
            debug!("[ORCH] Ignoring update of '{}' from superseded run {}", step_id, run_id);
            return Ok(());
        }
        let step = state
            .steps
            .iter_mut()
            .find(|s| s.id == step_id)
            .ok_or_else(|| ReconcileError::UnknownStep(step_id.to_string()))?;
        if !step.status.can_transition(status) {
            return Err(ReconcileError::InvalidTransition {
                step: step_id.to_string(),
                from: step.status.to_string(),
                to: status.to_string(),
            });
        }
        debug!("[ORCH] Step '{}': {} -> {}", step_id, step.status, status);
        step.status = status;
        step.error_message = if status == StepStatus::Error { error_message } else { None };
        Ok(())
    }

    pub fn set_waiting(&self, run_id: Uuid, waiting: bool) {
        let mut state = self.lock();
        if state.accepts(run_id) {
            state.waiting = waiting;
        }
    }

    /// Fails whatever is still loading. Returns whether anything changed.
    /// Afterwards no step is loading and at least one step is in error,
    /// unless every step already succeeded.
    pub fn enforce_timeout(&self, run_id: Uuid) -> bool {
        let mut state = self.lock();
        if !state.accepts(run_id) {
            return false;
        }
        state.waiting = false;

        let mut changed = false;
        for step in state.steps.iter_mut().filter(|s| s.status == StepStatus::Loading) {
            step.status = StepStatus::Error;
            step.error_message = Some(TIMEOUT_MESSAGE.to_string());
            changed = true;
        }
        if !changed && !state.has_error() && !state.all_completed() {
            if let Some(step) = state.steps.iter_mut().find(|s| s.status != StepStatus::Success) {
                step.status = StepStatus::Error;
                step.error_message = Some(TIMEOUT_MESSAGE.to_string());
                changed = true;
            }
        }
        if changed {
            warn!("[ORCH] Run {} timed out", run_id);
        }
        changed
    }

    /// Closes after `delay` once the run has finished (all success or any
    /// error) and nothing is mid-flight. Reopening or closing cancels it.
    pub fn schedule_auto_close(&self, run_id: Uuid, delay: Duration) -> bool {
        let mut state = self.lock();
        if !state.accepts(run_id) || state.is_waiting() || !(state.all_completed() || state.has_error()) {
            return false;
        }
        state.cancel_auto_close();
        let orchestrator = self.clone();
        state.auto_close = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = orchestrator.lock();
            if state.accepts(run_id) && !state.is_waiting() {
                debug!("[ORCH] Auto-closing run {}", run_id);
                state.open = false;
                state.auto_close = None;
            }
        }));
        true
    }

    pub fn cancel_auto_close(&self) {
        self.lock().cancel_auto_close();
    }

    pub fn close(&self) {
        let mut state = self.lock();
        state.cancel_auto_close();
        state.open = false;
        state.waiting = false;
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    pub fn run_id(&self) -> Uuid {
        self.lock().run_id
    }

    pub fn steps(&self) -> Vec<TransactionStep> {
        self.lock().steps.clone()
    }

    pub fn all_steps_completed(&self) -> bool {
        self.lock().all_completed()
    }

    pub fn has_error(&self) -> bool {
        self.lock().has_error()
    }

    pub fn is_waiting_tx(&self) -> bool {
        self.lock().is_waiting()
    }

    pub fn view(&self) -> DialogView {
        let state = self.lock();
        DialogView {
            open: state.open,
            kind: state.kind,
            label: state.label.clone(),
            run_id: state.run_id,
            steps: state.steps.clone(),
            all_steps_completed: state.all_completed(),
            has_error: state.has_error(),
            is_waiting_tx: state.is_waiting(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(o: &TransactionOrchestrator) -> Vec<String> {
        o.steps().into_iter().map(|s| s.id).collect()
    }

    #[test]
    fn templates_start_inactive() {
        let o = TransactionOrchestrator::new();
        o.open_dialog(OperationKind::Deposit, "cUSD");
        assert_eq!(ids(&o), vec!["check-balance", "approve", "deposit", "confirm"]);
        assert!(o.steps().iter().all(|s| s.status == StepStatus::Inactive));
        assert!(o.steps()[0].description.contains("cUSD"));

        o.open_dialog(OperationKind::Approve, "cUSD");
        assert_eq!(ids(&o), vec!["check-balance", "allowance", "approve", "confirm"]);
        o.open_dialog(OperationKind::Withdraw, "cUSD");
        assert_eq!(ids(&o), vec!["check-balance", "withdraw", "confirm"]);
    }

    #[test]
    fn transitions_are_enforced() {
        let o = TransactionOrchestrator::new();
        let run = o.open_dialog(OperationKind::Activate, "Circle");
        o.update_step(run, "activate", StepStatus::Loading, None).unwrap();
        o.update_step(run, "activate", StepStatus::Success, None).unwrap();
        let err = o.update_step(run, "activate", StepStatus::Loading, None).unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidTransition { .. }));
        assert_eq!(
            o.update_step(run, "nope", StepStatus::Loading, None),
            Err(ReconcileError::UnknownStep("nope".into()))
        );
        // skipped step
        o.update_step(run, "confirm", StepStatus::Success, None).unwrap();
        assert!(o.all_steps_completed());
    }

    #[test]
    fn error_leaves_later_steps_inactive() {
        let o = TransactionOrchestrator::new();
        let run = o.open_dialog(OperationKind::Contribute, "Circle");
        o.update_step(run, "check-balance", StepStatus::Loading, None).unwrap();
        o.update_step(run, "check-balance", StepStatus::Error, Some("Insufficient balance".into())).unwrap();
        let steps = o.steps();
        assert_eq!(steps[0].error_message.as_deref(), Some("Insufficient balance"));
        assert!(steps[1..].iter().all(|s| s.status == StepStatus::Inactive));
        assert!(o.has_error() && !o.is_waiting_tx());
    }

    #[test]
    fn updates_from_old_run_are_ignored() {
        let o = TransactionOrchestrator::new();
        let old = o.open_dialog(OperationKind::Join, "Circle");
        let new = o.open_dialog(OperationKind::Join, "Circle");
        o.update_step(old, "join", StepStatus::Loading, None).unwrap();
        assert_eq!(o.steps()[0].status, StepStatus::Inactive);
        o.update_step(new, "join", StepStatus::Loading, None).unwrap();
        assert_eq!(o.steps()[0].status, StepStatus::Loading);
    }

    #[test]
    fn timeout_never_leaves_loading() {
        let o = TransactionOrchestrator::new();
        let run = o.open_dialog(OperationKind::Contribute, "Circle");
        o.update_step(run, "check-balance", StepStatus::Success, None).unwrap();
        o.update_step(run, "allowance", StepStatus::Loading, None).unwrap();
        o.set_waiting(run, true);
        assert!(o.is_waiting_tx());

        assert!(o.enforce_timeout(run));
        let steps = o.steps();
        assert!(steps.iter().all(|s| s.status != StepStatus::Loading));
        assert_eq!(steps[1].error_message.as_deref(), Some(TIMEOUT_MESSAGE));
        assert!(!o.is_waiting_tx());
    }

    #[test]
    fn timeout_between_steps_still_errors() {
        let o = TransactionOrchestrator::new();
        let run = o.open_dialog(OperationKind::Join, "Circle");
        o.update_step(run, "join", StepStatus::Success, None).unwrap();
        o.set_waiting(run, true);
        assert!(o.enforce_timeout(run));
        let steps = o.steps();
        assert_eq!(steps[1].status, StepStatus::Error);
        assert!(o.has_error());
    }

    #[tokio::test(start_paused = true)]
    async fn auto_close_after_delay() {
        let o = TransactionOrchestrator::new();
        let run = o.open_dialog(OperationKind::Join, "Circle");
        assert!(!o.schedule_auto_close(run, Duration::from_secs(1)));

        o.update_step(run, "join", StepStatus::Success, None).unwrap();
        o.update_step(run, "confirm", StepStatus::Success, None).unwrap();
        assert!(o.schedule_auto_close(run, Duration::from_secs(1)));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(o.is_open());
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!o.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn reopening_cancels_auto_close() {
        let o = TransactionOrchestrator::new();
        let run = o.open_dialog(OperationKind::Activate, "Circle");
        o.update_step(run, "activate", StepStatus::Error, Some("Payout order not set".into())).unwrap();
        assert!(o.schedule_auto_close(run, Duration::from_secs(1)));

        o.open_dialog(OperationKind::Activate, "Circle");
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(o.is_open());
        assert!(!o.has_error());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_auto_close_leaves_dialog_open() {
        let o = TransactionOrchestrator::new();
        let run = o.open_dialog(OperationKind::Join, "Circle");
        o.update_step(run, "join", StepStatus::Success, None).unwrap();
        o.update_step(run, "confirm", StepStatus::Success, None).unwrap();
        assert!(o.schedule_auto_close(run, Duration::from_secs(1)));

        o.cancel_auto_close();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(o.is_open());
        assert!(o.all_steps_completed());
    }
}
