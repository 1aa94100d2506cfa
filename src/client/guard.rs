use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::client::cache::ReconciliationCache;
use crate::client::chain::{ChainReader, ThriftCall};
use crate::client::status::{derive_group_status_with_grace, derive_join_status};
use crate::common::models::{Address, GroupSnapshot};

pub const DATA_UNAVAILABLE: &str = "group data unavailable";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Action {
    Join,
    Contribute,
    Activate,
    Distribute,
    SetPayoutOrder { order: Vec<Address> },
    AddMember { member: Address },
    EmergencyWithdraw,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Join => "join",
            Action::Contribute => "contribute",
            Action::Activate => "activate",
            Action::Distribute => "distribute",
            Action::SetPayoutOrder { .. } => "setPayoutOrder",
            Action::AddMember { .. } => "addMember",
            Action::EmergencyWithdraw => "emergencyWithdraw",
        }
    }

    /// Irreversible actions need explicit confirmation whatever the guard says.
    pub fn is_irreversible(&self) -> bool {
        matches!(self, Action::EmergencyWithdraw)
    }

    /// Contract call this action submits once allowed.
    pub fn to_call(&self, group_id: u64, user_name: &str) -> ThriftCall {
        match self {
            Action::Join => ThriftCall::Join { group_id, user_name: user_name.to_string() },
            Action::Contribute => ThriftCall::Contribute { group_id },
            Action::Activate => ThriftCall::Activate { group_id },
            Action::Distribute => ThriftCall::Distribute { group_id },
            Action::SetPayoutOrder { order } => ThriftCall::SetPayoutOrder { group_id, order: order.clone() },
            Action::AddMember { member } => ThriftCall::AddMember { group_id, member: member.clone() },
            Action::EmergencyWithdraw => ThriftCall::EmergencyWithdraw { group_id },
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub requires_confirmation: bool,
}

impl Decision {
    pub fn allow() -> Self {
        Self { allowed: true, reason: None, requires_confirmation: false }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self { allowed: false, reason: Some(reason.into()), requires_confirmation: false }
    }

    /// Allowed, but irreversible: the caller must confirm before submitting.
    pub fn confirm() -> Self {
        Self { allowed: true, reason: None, requires_confirmation: true }
    }
}

/// Checks that `candidate` is exactly a permutation of `members`.
pub fn validate_payout_order(candidate: &[Address], members: &[Address]) -> Result<(), String> {
    if candidate.is_empty() {
        return Err("payout order is empty".to_string());
    }
    let mut seen = HashSet::new();
    for addr in candidate {
        if !seen.insert(addr) {
            return Err(format!("duplicate member in payout order: {}", addr));
        }
    }
    let member_set: HashSet<&Address> = members.iter().collect();
    if let Some(foreign) = candidate.iter().find(|a| !member_set.contains(a)) {
        return Err(format!("{} is not a member of this group", foreign));
    }
    if let Some(missing) = members.iter().find(|m| !seen.contains(m)) {
        return Err(format!("payout order is missing member {}", missing));
    }
    Ok(())
}

/// Evaluates `action` against one snapshot. Never fails: denials carry a
/// user-facing reason.
pub fn can_perform(
    action: &Action,
    snapshot: &GroupSnapshot,
    caller: &Address,
    now: DateTime<Utc>,
    grace_secs: i64,
) -> Decision {
    let group = match &snapshot.group {
        Some(g) => g,
        None => return Decision::deny("group not found"),
    };
    let member = snapshot.member(caller);
    let is_admin = group.is_admin(caller);

    match action {
        Action::Join => {
            let join = derive_join_status(Some(group), member, caller);
            match join.reason {
                Some(reason) => Decision::deny(reason.to_string()),
                None if !group.is_public => Decision::deny("group is private"),
                None => Decision::allow(),
            }
        }
        Action::Contribute => {
            let join = derive_join_status(Some(group), member, caller);
            let status = derive_group_status_with_grace(Some(group), now, grace_secs);
            if !join.is_member {
                Decision::deny("not a member")
            } else if !status.is_started {
                let reason = status.reason.map(|r| r.to_string());
                Decision::deny(reason.unwrap_or_else(|| "group not started".to_string()))
            } else {
                Decision::allow()
            }
        }
        Action::Activate => {
            if !is_admin {
                Decision::deny("only the group admin can activate")
            } else if group.is_active {
                Decision::deny("group already active")
            } else if group.payout_order.len() != group.total_members as usize {
                Decision::deny("payout order not set")
            } else {
                Decision::allow()
            }
        }
        Action::Distribute => {
            if !is_admin {
                Decision::deny("only the group admin can distribute")
            } else if !group.is_active {
                Decision::deny("group not active")
            } else {
                Decision::allow()
            }
        }
        Action::SetPayoutOrder { order } => {
            if !is_admin {
                Decision::deny("only the group admin can set the payout order")
            } else if group.is_active {
                Decision::deny("group already active")
            } else {
                match validate_payout_order(order, &snapshot.member_addresses()) {
                    Ok(()) => Decision::allow(),
                    Err(reason) => Decision::deny(reason),
                }
            }
        }
        Action::AddMember { member: target } => {
            if group.is_public {
                Decision::deny("group is public")
            } else if !is_admin {
                Decision::deny("only the group admin can add members")
            } else if group.is_full() {
                Decision::deny("group full")
            } else if snapshot.member(target).is_some() {
                Decision::deny("already a member")
            } else {
                Decision::allow()
            }
        }
        Action::EmergencyWithdraw => {
            if !is_admin {
                Decision::deny("only the group admin can withdraw")
            } else {
                Decision::confirm()
            }
        }
    }
}

/// Cache-backed guard. Decides only against a fresh snapshot and fails
/// closed when none is available.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActionGuard {
    grace_secs: i64,
}

impl ActionGuard {
    pub fn new(grace_secs: i64) -> Self {
        Self { grace_secs }
    }

    pub fn check<R: ChainReader>(
        &self,
        cache: &ReconciliationCache<R>,
        group_id: u64,
        action: &Action,
        caller: &Address,
        now: DateTime<Utc>,
    ) -> Decision {
        let decision = match cache.get(group_id) {
            Some(snapshot) => can_perform(action, &snapshot, caller, now, self.grace_secs),
            None => Decision::deny(DATA_UNAVAILABLE),
        };
        debug!(
            "[GUARD] {} on group {} by {}: {}",
            action,
            group_id,
            caller.short(),
            match &decision.reason {
                Some(r) => r.as_str(),
                None => "allowed",
            }
        );
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::services::memory_chain::MemoryChain;
    use crate::client::status::derive_group_status;
    use crate::common::errors::ReconcileError;
    use crate::common::models::{Group, Member};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn addr(n: u8) -> Address {
        Address::parse(&format!("0x{}", format!("{:02x}", n).repeat(20))).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn snapshot(members: &[u8], admin: u8) -> GroupSnapshot {
        let group = Group {
            id: 7,
            name: "Circle".into(),
            admin: addr(admin),
            deposit_amount: 100,
            token_symbol: "cUSD".into(),
            max_members: 5,
            total_members: members.len() as u32,
            is_public: true,
            is_active: false,
            is_paused: false,
            current_round: 0,
            completed_payouts: 0,
            payout_order: vec![],
            activated_at: None,
            start_offset_secs: 0,
            next_payment_date: None,
        };
        GroupSnapshot {
            id: 7,
            group: Some(group),
            members: members
                .iter()
                .map(|n| Member { address: addr(*n), user_name: format!("m{}", n), join_date: None, payout_position: None })
                .collect(),
            fetched_at: at(0),
            token: 1,
        }
    }

    fn group_mut(s: &mut GroupSnapshot) -> &mut Group {
        s.group.as_mut().unwrap()
    }

    #[test]
    fn activate_without_payout_order_is_denied() {
        let mut s = snapshot(&[1, 2, 3, 4, 5], 1);
        group_mut(&mut s).max_members = 5;
        let d = can_perform(&Action::Activate, &s, &addr(1), at(0), 0);
        assert!(!d.allowed);
        assert_eq!(d.reason.as_deref(), Some("payout order not set"));

        group_mut(&mut s).payout_order = (1..=5).map(addr).collect();
        assert!(can_perform(&Action::Activate, &s, &addr(1), at(0), 0).allowed);
        assert!(!can_perform(&Action::Activate, &s, &addr(2), at(0), 0).allowed);

        // lengths agree at zero; the contract decides the rest
        let empty = snapshot(&[], 1);
        assert!(can_perform(&Action::Activate, &empty, &addr(1), at(0), 0).allowed);
    }

    #[test]
    fn contribute_matches_membership_and_start() {
        let mut s = snapshot(&[1, 2], 1);
        let cases = [(false, None), (true, None), (true, Some(100)), (true, Some(0))];
        for (active, activated) in cases {
            {
                let g = group_mut(&mut s);
                g.is_active = active;
                g.activated_at = activated.map(at);
            }
            for caller in [addr(2), addr(9)] {
                let g = s.group.as_ref().unwrap();
                let expected = derive_join_status(Some(g), s.member(&caller), &caller).is_member
                    && derive_group_status(Some(g), at(50)).is_started;
                let d = can_perform(&Action::Contribute, &s, &caller, at(50), 0);
                assert_eq!(d.allowed, expected, "active={} activated={:?}", active, activated);
            }
        }
    }

    #[test]
    fn payout_order_must_be_a_permutation() {
        let members: Vec<Address> = [1, 2, 3].into_iter().map(addr).collect();
        assert!(validate_payout_order(&[addr(3), addr(1), addr(2)], &members).is_ok());

        let missing = validate_payout_order(&[addr(1), addr(2)], &members).unwrap_err();
        assert!(missing.contains("missing"), "{}", missing);

        let dup = validate_payout_order(&[addr(1), addr(1), addr(2)], &members).unwrap_err();
        assert!(dup.contains("duplicate"), "{}", dup);

        let foreign = validate_payout_order(&[addr(1), addr(2), addr(9)], &members).unwrap_err();
        assert!(foreign.contains("not a member"), "{}", foreign);

        // same length, still wrong
        let swapped = validate_payout_order(&[addr(1), addr(2), addr(2)], &members).unwrap_err();
        assert!(swapped.contains("duplicate"));
    }

    #[test]
    fn set_payout_order_is_admin_only_and_pre_activation() {
        let mut s = snapshot(&[1, 2], 1);
        let order = Action::SetPayoutOrder { order: vec![addr(2), addr(1)] };
        assert!(can_perform(&order, &s, &addr(1), at(0), 0).allowed);
        assert!(!can_perform(&order, &s, &addr(2), at(0), 0).allowed);
        group_mut(&mut s).is_active = true;
        assert_eq!(
            can_perform(&order, &s, &addr(1), at(0), 0).reason.as_deref(),
            Some("group already active")
        );
    }

    #[test]
    fn add_member_rules() {
        let mut s = snapshot(&[1, 2], 1);
        let add = Action::AddMember { member: addr(3) };
        assert_eq!(can_perform(&add, &s, &addr(1), at(0), 0).reason.as_deref(), Some("group is public"));

        group_mut(&mut s).is_public = false;
        assert!(can_perform(&add, &s, &addr(1), at(0), 0).allowed);
        assert!(!can_perform(&add, &s, &addr(2), at(0), 0).allowed);
        let existing = Action::AddMember { member: addr(2) };
        assert_eq!(can_perform(&existing, &s, &addr(1), at(0), 0).reason.as_deref(), Some("already a member"));

        group_mut(&mut s).max_members = 2;
        assert_eq!(can_perform(&add, &s, &addr(1), at(0), 0).reason.as_deref(), Some("group full"));
    }

    #[test]
    fn emergency_withdraw_needs_confirmation() {
        let s = snapshot(&[1, 2], 1);
        let d = can_perform(&Action::EmergencyWithdraw, &s, &addr(1), at(0), 0);
        assert!(d.allowed && d.requires_confirmation);
        assert!(!can_perform(&Action::EmergencyWithdraw, &s, &addr(2), at(0), 0).allowed);
    }

    #[test]
    fn distribute_and_join() {
        let mut s = snapshot(&[1, 2], 1);
        assert_eq!(
            can_perform(&Action::Distribute, &s, &addr(1), at(0), 0).reason.as_deref(),
            Some("group not active")
        );
        assert!(can_perform(&Action::Join, &s, &addr(9), at(0), 0).allowed);
        group_mut(&mut s).is_active = true;
        assert!(can_perform(&Action::Distribute, &s, &addr(1), at(0), 0).allowed);
        assert_eq!(
            can_perform(&Action::Join, &s, &addr(9), at(0), 0).reason.as_deref(),
            Some("group already active")
        );
    }

    #[test]
    fn missing_group_denies_everything() {
        let mut s = snapshot(&[1], 1);
        s.group = None;
        for action in [Action::Join, Action::Contribute, Action::Activate, Action::EmergencyWithdraw] {
            assert_eq!(can_perform(&action, &s, &addr(1), at(0), 0).reason.as_deref(), Some("group not found"));
        }
    }

    #[tokio::test]
    async fn cache_backed_guard_fails_closed() {
        let chain = Arc::new(MemoryChain::new());
        let admin = addr(1);
        let id = chain.create_group(&admin, "Circle", 100, "cUSD", 5, true);
        let cache = ReconciliationCache::new(chain.clone());
        let guard = ActionGuard::new(0);

        let d = guard.check(&cache, id, &Action::EmergencyWithdraw, &admin, chain.now());
        assert_eq!(d.reason.as_deref(), Some(DATA_UNAVAILABLE));

        cache.refresh(id).await.unwrap();
        assert!(guard.check(&cache, id, &Action::EmergencyWithdraw, &admin, chain.now()).allowed);

        cache.invalidate(id);
        chain.fail_next_reads(1);
        assert!(cache.refresh(id).await.is_err());
        let d = guard.check(&cache, id, &Action::EmergencyWithdraw, &admin, chain.now());
        assert_eq!(d.reason.as_deref(), Some(DATA_UNAVAILABLE));
    }

    #[tokio::test]
    async fn out_of_range_offset_from_chain_is_rejected_not_panicking() {
        let chain = Arc::new(MemoryChain::new());
        let admin = addr(1);
        let id = chain.create_group(&admin, "Circle", 100, "cUSD", 5, true);
        chain.set_start_offset(id, i64::MAX);
        let cache = ReconciliationCache::new(chain.clone());
        let guard = ActionGuard::new(0);

        match cache.refresh(id).await {
            Err(ReconcileError::Validation { field, .. }) => assert_eq!(field, "startOffset"),
            other => panic!("unexpected {:?}", other.map(|s| s.token)),
        }
        let d = guard.check(&cache, id, &Action::Contribute, &admin, chain.now());
        assert_eq!(d.reason.as_deref(), Some(DATA_UNAVAILABLE));
    }
}
