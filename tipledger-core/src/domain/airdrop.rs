//! Airdrop domain model

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AirdropStatus {
    Active,
    Completed,
    Expired,
}

/// A live airdrop: `max_users` equal shares, each collectable once per user
#[derive(Debug, Clone, Serialize)]
pub struct Airdrop {
    pub id: Uuid,
    pub creator_id: String,
    pub currency: String,
    pub total_amount: Decimal,
    pub share: Decimal,
    pub max_users: u32,
    pub collected_by: HashSet<String>,
    pub created_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub status: AirdropStatus,
}

impl Airdrop {
    pub fn remaining_slots(&self) -> u32 {
        self.max_users
            .saturating_sub(self.collected_by.len() as u32)
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.status == AirdropStatus::Active && now < self.ends_at && self.remaining_slots() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_open_until_full_or_ended() {
        let now = Utc::now();
        let mut drop = Airdrop {
            id: Uuid::new_v4(),
            creator_id: "creator".to_string(),
            currency: "SOL".to_string(),
            total_amount: Decimal::new(2, 2),
            share: Decimal::new(1, 2),
            max_users: 2,
            collected_by: HashSet::new(),
            created_at: now,
            ends_at: now + Duration::minutes(10),
            status: AirdropStatus::Active,
        };
        assert!(drop.is_open(now));
        assert!(!drop.is_open(now + Duration::minutes(10)));

        drop.collected_by.insert("a".to_string());
        drop.collected_by.insert("b".to_string());
        assert_eq!(drop.remaining_slots(), 0);
        assert!(!drop.is_open(now));
    }
}
