use chrono::{DateTime, Duration, Utc};
use std::fmt;

use crate::common::models::{Address, Group, Member};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusReason {
    NotFound,
    NotActive,
    NotStarted,
    Paused,
    NoMembers,
}

impl fmt::Display for StatusReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StatusReason::NotFound => "group not found",
            StatusReason::NotActive => "group not active",
            StatusReason::NotStarted => "group not started",
            StatusReason::Paused => "group paused",
            StatusReason::NoMembers => "group has no members",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinDenial {
    NotFound,
    AlreadyMember,
    AlreadyActive,
    Full,
}

impl fmt::Display for JoinDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JoinDenial::NotFound => "group not found",
            JoinDenial::AlreadyMember => "already a member",
            JoinDenial::AlreadyActive => "group already active",
            JoinDenial::Full => "group full",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupStatus {
    pub exists: bool,
    pub is_active: bool,
    pub is_started: bool,
    pub can_contribute: bool,
    pub reason: Option<StatusReason>,
    pub start_date: Option<DateTime<Utc>>,
    pub time_until_start: Option<Duration>,
}

impl GroupStatus {
    fn not_found() -> Self {
        Self {
            exists: false,
            is_active: false,
            is_started: false,
            can_contribute: false,
            reason: Some(StatusReason::NotFound),
            start_date: None,
            time_until_start: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinStatus {
    pub is_member: bool,
    pub can_join: bool,
    pub reason: Option<JoinDenial>,
}

/// Activation time plus the group offset plus a client-wide grace period.
/// `None` when the group was never activated or the sum leaves chrono's range.
pub fn start_date(group: &Group, grace_secs: i64) -> Option<DateTime<Utc>> {
    let grace = Duration::try_seconds(grace_secs)?;
    group
        .activated_at?
        .checked_add_signed(group.start_offset()?)?
        .checked_add_signed(grace)
}

pub fn derive_group_status(group: Option<&Group>, now: DateTime<Utc>) -> GroupStatus {
    derive_group_status_with_grace(group, now, 0)
}

pub fn derive_group_status_with_grace(
    group: Option<&Group>,
    now: DateTime<Utc>,
    grace_secs: i64,
) -> GroupStatus {
    let group = match group {
        Some(g) => g,
        None => return GroupStatus::not_found(),
    };

    let start = start_date(group, grace_secs);
    let is_active = group.is_active;
    let is_started = is_active && start.map(|s| now >= s).unwrap_or(false);
    let can_contribute = is_started && group.total_members > 0 && !group.is_paused;

    // first failing precondition wins
    let reason = if !is_active {
        Some(StatusReason::NotActive)
    } else if !is_started {
        Some(StatusReason::NotStarted)
    } else if group.is_paused {
        Some(StatusReason::Paused)
    } else if group.total_members == 0 {
        Some(StatusReason::NoMembers)
    } else {
        None
    };

    GroupStatus {
        exists: true,
        is_active,
        is_started,
        can_contribute,
        reason,
        start_date: start,
        time_until_start: start.map(|s| (s - now).max(Duration::zero())),
    }
}

/// `member` is the caller's membership row if the caller is one; a row for a
/// different address does not count.
pub fn derive_join_status(group: Option<&Group>, member: Option<&Member>, caller: &Address) -> JoinStatus {
    let is_member = member.map(|m| m.address == *caller).unwrap_or(false);

    let reason = match group {
        None => Some(JoinDenial::NotFound),
        Some(_) if is_member => Some(JoinDenial::AlreadyMember),
        Some(g) if g.is_active => Some(JoinDenial::AlreadyActive),
        Some(g) if g.is_full() => Some(JoinDenial::Full),
        Some(_) => None,
    };

    JoinStatus {
        is_member,
        can_join: reason.is_none(),
        reason,
    }
}

/// Member due the payout of the round in progress.
pub fn next_recipient(group: &Group) -> Option<&Address> {
    if !group.is_active || group.payout_order.is_empty() {
        return None;
    }
    let idx = group.completed_payouts as usize % group.payout_order.len();
    group.payout_order.get(idx)
}

pub fn past_recipient(group: &Group) -> Option<&Address> {
    if group.completed_payouts == 0 || group.payout_order.is_empty() {
        return None;
    }
    let idx = (group.completed_payouts as usize - 1) % group.payout_order.len();
    group.payout_order.get(idx)
}
