use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashSet;

use crate::common::errors::{ReconcileError, Result};
use crate::common::models::{
    Address, ContributionRecord, Group, GroupRecord, Member, MemberRecord, RawEvent, MAX_START_OFFSET_SECS,
};

fn required<T>(value: Option<T>, field: &str) -> Result<T> {
    value.ok_or_else(|| ReconcileError::validation(field, "missing"))
}

fn parse_amount(raw: &str, field: &str) -> Result<u128> {
    raw.trim()
        .parse::<u128>()
        .map_err(|e| ReconcileError::validation(field, format!("`{}` is not a base-unit amount: {}", raw, e)))
}

fn parse_timestamp(secs: i64, field: &str) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| ReconcileError::validation(field, format!("{} is out of range", secs)))
}

fn parse_address(raw: &str, field: &str) -> Result<Address> {
    Address::parse(raw).map_err(|e| match e {
        ReconcileError::Validation { message, .. } => ReconcileError::validation(field, message),
        other => other,
    })
}

/// Unknown ids come back from the contract as zeroed structs; those count as
/// "not found", not as malformed data.
pub fn is_empty_record(record: &GroupRecord) -> bool {
    record.max_members.unwrap_or(0) == 0
        && record
            .admin
            .as_deref()
            .map(|a| a.trim_start_matches("0x").chars().all(|c| c == '0'))
            .unwrap_or(true)
}

pub fn validate_group(id: u64, record: GroupRecord) -> Result<Group> {
    if let Some(reported) = record.id {
        if reported != id {
            return Err(ReconcileError::validation(
                "id",
                format!("asked for group {} but chain returned {}", id, reported),
            ));
        }
    }

    let admin = parse_address(&required(record.admin, "admin")?, "admin")?;
    let deposit_amount = parse_amount(&required(record.deposit_amount, "depositAmount")?, "depositAmount")?;
    let max_members = required(record.max_members, "maxMembers")?;
    let total_members = required(record.total_members, "totalMembers")?;
    if max_members == 0 {
        return Err(ReconcileError::validation("maxMembers", "must be positive"));
    }
    if total_members > max_members {
        return Err(ReconcileError::validation(
            "totalMembers",
            format!("{} members exceeds capacity {}", total_members, max_members),
        ));
    }

    let mut payout_order = Vec::new();
    let mut seen = HashSet::new();
    for raw in record.payout_order.unwrap_or_default() {
        let address = parse_address(&raw, "payoutOrder")?;
        if !seen.insert(address.clone()) {
            return Err(ReconcileError::validation(
                "payoutOrder",
                format!("{} appears twice", address),
            ));
        }
        payout_order.push(address);
    }

    let is_active = required(record.is_active, "isActive")?;
    let activated_at = record
        .activated_at
        .filter(|secs| *secs > 0)
        .map(|secs| parse_timestamp(secs, "activatedAt"))
        .transpose()?;
    let next_payment_date = record
        .next_payment_date
        .filter(|secs| *secs > 0)
        .map(|secs| parse_timestamp(secs, "nextPaymentDate"))
        .transpose()?;
    let start_offset_secs = record.start_offset_secs.unwrap_or(0);
    if !(0..=MAX_START_OFFSET_SECS).contains(&start_offset_secs) {
        return Err(ReconcileError::validation(
            "startOffset",
            format!("{} seconds is outside 0..={}", start_offset_secs, MAX_START_OFFSET_SECS),
        ));
    }

    Ok(Group {
        id,
        name: record.name.unwrap_or_else(|| format!("Group #{}", id)),
        admin,
        deposit_amount,
        token_symbol: required(record.token_symbol, "tokenSymbol")?,
        max_members,
        total_members,
        is_public: required(record.is_public, "isPublic")?,
        is_active,
        is_paused: record.is_paused.unwrap_or(false),
        current_round: record.current_round.unwrap_or(0),
        completed_payouts: record.completed_payouts.unwrap_or(0),
        payout_order,
        activated_at,
        start_offset_secs,
        next_payment_date,
    })
}

/// Validates the member list against an already validated group, filling in
/// each member's payout position.
pub fn validate_members(group: &Group, records: Vec<MemberRecord>) -> Result<Vec<Member>> {
    let mut members = Vec::with_capacity(records.len());
    let mut seen = HashSet::new();
    for record in records {
        let address = parse_address(&required(record.address, "members.address")?, "members.address")?;
        if !seen.insert(address.clone()) {
            return Err(ReconcileError::validation(
                "members.address",
                format!("{} listed twice", address),
            ));
        }
        let join_date = record
            .join_date
            .filter(|secs| *secs > 0)
            .map(|secs| parse_timestamp(secs, "members.joinDate"))
            .transpose()?;
        let payout_position = group.payout_order.iter().position(|a| *a == address);
        members.push(Member {
            user_name: record.user_name.unwrap_or_else(|| address.short()),
            address,
            join_date,
            payout_position,
        });
    }
    if members.len() > group.max_members as usize {
        return Err(ReconcileError::validation(
            "members",
            format!("{} members exceeds capacity {}", members.len(), group.max_members),
        ));
    }
    Ok(members)
}

pub fn validate_event(group_id: u64, token_symbol: &str, event: RawEvent) -> Result<ContributionRecord> {
    if let Some(reported) = event.group_id {
        if reported != group_id {
            return Err(ReconcileError::validation(
                "event.groupId",
                format!("event for group {} in query for {}", reported, group_id),
            ));
        }
    }
    let transaction_hash = required(event.transaction_hash, "event.transactionHash")?.to_ascii_lowercase();
    if !transaction_hash.starts_with("0x") || transaction_hash.len() != 66 {
        return Err(ReconcileError::validation(
            "event.transactionHash",
            format!("`{}` is not a 32-byte hash", transaction_hash),
        ));
    }
    Ok(ContributionRecord {
        date: parse_timestamp(required(event.timestamp, "event.timestamp")?, "event.timestamp")?,
        member: parse_address(&required(event.member, "event.member")?, "event.member")?,
        amount: parse_amount(&required(event.amount, "event.amount")?, "event.amount")?,
        token_symbol: token_symbol.to_string(),
        transaction_hash,
        block_number: required(event.block_number, "event.blockNumber")?,
        log_index: event.log_index.unwrap_or(0),
    })
}
