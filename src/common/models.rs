use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::common::errors::ReconcileError;

/// Upper bound for start offsets and grace periods, roughly a century.
pub const MAX_START_OFFSET_SECS: i64 = 100 * 365 * 24 * 3600;

/// An account address, normalised to lowercase hex so comparisons ignore
/// checksum casing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn parse(raw: &str) -> Result<Self, ReconcileError> {
        let trimmed = raw.trim();
        let hex = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| ReconcileError::validation("address", format!("`{}` lacks 0x prefix", raw)))?;
        if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ReconcileError::validation(
                "address",
                format!("`{}` is not a 20-byte hex address", raw),
            ));
        }
        Ok(Address(format!("0x{}", hex.to_ascii_lowercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `0x1234…abcd` form for log lines.
    pub fn short(&self) -> String {
        format!("{}…{}", &self.0[..6], &self.0[self.0.len() - 4..])
    }
}

impl TryFrom<String> for Address {
    type Error = ReconcileError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Address::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Group record exactly as the chain reader hands it over. Every field is
/// optional; `common::validation` decides what is acceptable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupRecord {
    pub id: Option<u64>,
    pub name: Option<String>,
    pub admin: Option<String>,
    /// Base units, decimal string (token amounts overflow JSON numbers).
    pub deposit_amount: Option<String>,
    pub token_symbol: Option<String>,
    pub max_members: Option<u32>,
    pub total_members: Option<u32>,
    pub is_public: Option<bool>,
    pub is_active: Option<bool>,
    pub is_paused: Option<bool>,
    pub current_round: Option<u32>,
    pub completed_payouts: Option<u32>,
    pub payout_order: Option<Vec<String>>,
    /// Unix seconds.
    pub activated_at: Option<i64>,
    pub start_offset_secs: Option<i64>,
    pub next_payment_date: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemberRecord {
    pub address: Option<String>,
    pub user_name: Option<String>,
    pub join_date: Option<i64>,
}

/// A `ContributionMade` log as returned by the event query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawEvent {
    pub group_id: Option<u64>,
    pub member: Option<String>,
    pub amount: Option<String>,
    pub transaction_hash: Option<String>,
    pub block_number: Option<u64>,
    pub log_index: Option<u32>,
    pub timestamp: Option<i64>,
}

/// A rotating savings circle after boundary validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: u64,
    pub name: String,
    pub admin: Address,
    pub deposit_amount: u128,
    pub token_symbol: String,
    pub max_members: u32,
    pub total_members: u32,
    pub is_public: bool,
    pub is_active: bool,
    pub is_paused: bool,
    pub current_round: u32,
    pub completed_payouts: u32,
    pub payout_order: Vec<Address>,
    pub activated_at: Option<DateTime<Utc>>,
    pub start_offset_secs: i64,
    pub next_payment_date: Option<DateTime<Utc>>,
}

impl Group {
    pub fn is_admin(&self, caller: &Address) -> bool {
        self.admin == *caller
    }

    pub fn is_full(&self) -> bool {
        self.total_members >= self.max_members
    }

    pub fn start_offset(&self) -> Option<Duration> {
        Duration::try_seconds(self.start_offset_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub address: Address,
    pub user_name: String,
    pub join_date: Option<DateTime<Utc>>,
    /// Index into the group's payout order, once one is set.
    pub payout_position: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributionRecord {
    pub date: DateTime<Utc>,
    pub member: Address,
    pub amount: u128,
    pub token_symbol: String,
    pub transaction_hash: String,
    pub block_number: u64,
    pub log_index: u32,
}

/// Group and members read together. The guard only ever decides against one
/// of these, never against a mix of reads.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSnapshot {
    pub id: u64,
    pub group: Option<Group>,
    pub members: Vec<Member>,
    pub fetched_at: DateTime<Utc>,
    /// Monotonic refresh token the snapshot was produced under.
    pub token: u64,
}

impl GroupSnapshot {
    pub fn member(&self, address: &Address) -> Option<&Member> {
        self.members.iter().find(|m| m.address == *address)
    }

    pub fn member_addresses(&self) -> Vec<Address> {
        self.members.iter().map(|m| m.address.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_normalises_case() {
        let a = Address::parse("0xAbCdEf0123456789abcdef0123456789ABCDEF01").unwrap();
        let b = Address::parse(" 0xabcdef0123456789ABCDEF0123456789abcdef01 ").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "0xabcdef0123456789abcdef0123456789abcdef01");
        assert_eq!(a.short(), "0xabcd…ef01");
    }

    #[test]
    fn address_rejects_garbage() {
        assert!(Address::parse("abcdef0123456789abcdef0123456789abcdef01").is_err());
        assert!(Address::parse("0x1234").is_err());
        assert!(Address::parse("0xzzcdef0123456789abcdef0123456789abcdef01").is_err());
    }

    #[test]
    fn address_deserialises_through_validation() {
        let ok: Address =
            serde_json::from_str("\"0x00000000000000000000000000000000000000AA\"").unwrap();
        assert_eq!(ok.as_str(), "0x00000000000000000000000000000000000000aa");
        assert!(serde_json::from_str::<Address>("\"nope\"").is_err());
    }
}
