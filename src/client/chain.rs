use serde::{Deserialize, Serialize};
use std::future::Future;

use crate::common::models::{Address, GroupRecord, MemberRecord, RawEvent};

pub trait ChainReader: Send + Sync + 'static {
    /// `Ok(None)` when the contract has no such group.
    fn get_group(&self, id: u64) -> impl Future<Output = anyhow::Result<Option<GroupRecord>>> + Send;

    fn get_members(&self, id: u64) -> impl Future<Output = anyhow::Result<Vec<MemberRecord>>> + Send;

    /// `ContributionMade` logs for `id` in `[from_block, to_block]`; open
    /// bounds mean genesis / latest.
    fn get_contribution_events(
        &self,
        id: u64,
        from_block: Option<u64>,
        to_block: Option<u64>,
    ) -> impl Future<Output = anyhow::Result<Vec<RawEvent>>> + Send;

    fn block_number(&self) -> impl Future<Output = anyhow::Result<u64>> + Send;

    fn token_balance(
        &self,
        owner: &Address,
        token_symbol: &str,
    ) -> impl Future<Output = anyhow::Result<u128>> + Send;

    /// What the thrift/savings contract may currently pull from `owner`.
    fn allowance(
        &self,
        owner: &Address,
        token_symbol: &str,
    ) -> impl Future<Output = anyhow::Result<u128>> + Send;
}

pub trait ChainWriter: Send + Sync + 'static {
    /// Signs and broadcasts. Gas estimation runs here, so contract
    /// preconditions usually surface as an error from this call.
    fn submit(
        &self,
        from: &Address,
        call: &ThriftCall,
    ) -> impl Future<Output = anyhow::Result<TxHandle>> + Send;

    fn wait_for_receipt(&self, tx: &TxHandle) -> impl Future<Output = anyhow::Result<Receipt>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "camelCase")]
pub enum ThriftCall {
    Join { group_id: u64, user_name: String },
    Contribute { group_id: u64 },
    Activate { group_id: u64 },
    Distribute { group_id: u64 },
    SetPayoutOrder { group_id: u64, order: Vec<Address> },
    AddMember { group_id: u64, member: Address },
    EmergencyWithdraw { group_id: u64 },
    Approve { token_symbol: String, amount: u128 },
    Deposit { token_symbol: String, amount: u128 },
    Withdraw { token_symbol: String },
    BreakTimelock { token_symbol: String },
    Payment { token_symbol: String, recipient: Address, amount: u128, reference: String },
}

impl ThriftCall {
    pub fn method(&self) -> &'static str {
        match self {
            ThriftCall::Join { .. } => "joinPublicGroup",
            ThriftCall::Contribute { .. } => "makeContribution",
            ThriftCall::Activate { .. } => "activateThriftGroup",
            ThriftCall::Distribute { .. } => "distributePayout",
            ThriftCall::SetPayoutOrder { .. } => "setPayoutOrder",
            ThriftCall::AddMember { .. } => "addMemberToPrivateGroup",
            ThriftCall::EmergencyWithdraw { .. } => "emergencyWithdraw",
            ThriftCall::Approve { .. } => "approve",
            ThriftCall::Deposit { .. } => "deposit",
            ThriftCall::Withdraw { .. } => "withdraw",
            ThriftCall::BreakTimelock { .. } => "breakTimelock",
            ThriftCall::Payment { .. } => "transfer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxHandle {
    pub hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptStatus {
    Success,
    Reverted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: String,
    pub block_number: u64,
    pub status: ReceiptStatus,
    pub revert_reason: Option<String>,
}

pub const GENERIC_FAILURE: &str = "Transaction failed on blockchain";

/// Pulls the contract's revert string out of a client error message.
pub fn revert_reason(message: &str) -> Option<String> {
    const MARKERS: [&str; 2] = ["reverted with reason string '", "execution reverted: "];
    for marker in MARKERS {
        if let Some(idx) = message.find(marker) {
            let rest = &message[idx + marker.len()..];
            let end = rest
                .find(|c| c == '\'' || c == '"' || c == '\n')
                .unwrap_or(rest.len());
            let reason = rest[..end].trim();
            if !reason.is_empty() {
                return Some(reason.to_string());
            }
        }
    }
    None
}

/// User-facing copy for a failed submission or receipt.
pub fn describe_failure(message: &str) -> String {
    if let Some(reason) = revert_reason(message) {
        return reason;
    }
    let lower = message.to_ascii_lowercase();
    if lower.contains("user rejected") || lower.contains("user denied") {
        "Transaction was cancelled by user".to_string()
    } else if lower.contains("insufficient funds") {
        "Insufficient funds for gas".to_string()
    } else if lower.contains("execution reverted") {
        GENERIC_FAILURE.to_string()
    } else {
        message.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_revert_strings() {
        assert_eq!(
            revert_reason("Error: execution reverted: Payout order not set"),
            Some("Payout order not set".to_string())
        );
        assert_eq!(
            revert_reason("VM Exception: reverted with reason string 'Group is full'"),
            Some("Group is full".to_string())
        );
        assert_eq!(revert_reason("execution reverted"), None);
    }

    #[test]
    fn describes_common_failures() {
        assert_eq!(describe_failure("user rejected transaction"), "Transaction was cancelled by user");
        assert_eq!(describe_failure("execution reverted"), GENERIC_FAILURE);
        assert_eq!(describe_failure("nonce too low"), "nonce too low");
    }

    #[test]
    fn calls_map_to_contract_methods() {
        assert_eq!(ThriftCall::Activate { group_id: 1 }.method(), "activateThriftGroup");
    }
}
