//! Airdrop book - live airdrops and who has collected them
//!
//! Airdrops are short-lived and kept in memory. A collect first reserves a
//! slot here, then moves funds; if moving funds fails the slot is released
//! so the user can try again.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::result::{Error, Result};
use crate::domain::token;
use crate::domain::{validate_user_id, Airdrop, AirdropStatus};
use crate::ports::Clock;

/// A slot reserved for one user in one airdrop
#[derive(Debug, Clone, PartialEq)]
pub struct ReservedShare {
    pub airdrop_id: Uuid,
    pub creator_id: String,
    pub currency: String,
    pub share: Decimal,
    pub remaining_slots: u32,
}

pub struct AirdropBook {
    airdrops: Mutex<HashMap<Uuid, Airdrop>>,
    clock: Arc<dyn Clock>,
}

impl AirdropBook {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            airdrops: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Uuid, Airdrop>>> {
        self.airdrops
            .lock()
            .map_err(|_| Error::database("airdrop book lock poisoned"))
    }

    /// Open an airdrop of `max_users` equal shares
    ///
    /// Each share is `total_amount / max_users` truncated to `precision`
    /// decimal places (never finer than the token allows).
    pub fn create(
        &self,
        creator_id: &str,
        total_amount: Decimal,
        currency: &str,
        max_users: u32,
        duration: Duration,
        precision: u32,
    ) -> Result<Airdrop> {
        validate_user_id(creator_id)?;
        let token = token::lookup(currency)?;
        token.validate_amount(total_amount)?;
        if max_users == 0 {
            return Err(Error::validation("an airdrop needs at least one user"));
        }
        if duration <= Duration::zero() {
            return Err(Error::validation("airdrop duration must be positive"));
        }

        let share = token.floor_to(total_amount / Decimal::from(max_users), precision);
        if share <= Decimal::ZERO {
            return Err(Error::InvalidAmount(format!(
                "{} {} split {} ways rounds to zero",
                total_amount, token.symbol, max_users
            )));
        }

        let now = self.clock.now();
        let airdrop = Airdrop {
            id: Uuid::new_v4(),
            creator_id: creator_id.to_string(),
            currency: token.symbol.to_string(),
            total_amount,
            share,
            max_users,
            collected_by: HashSet::new(),
            created_at: now,
            ends_at: now + duration,
            status: AirdropStatus::Active,
        };

        self.lock()?.insert(airdrop.id, airdrop.clone());
        info!(airdrop_id = %airdrop.id, currency = token.symbol, max_users, "airdrop created");
        Ok(airdrop)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Airdrop>> {
        Ok(self.lock()?.get(&id).cloned())
    }

    /// Airdrops that can still be collected
    pub fn active(&self) -> Result<Vec<Airdrop>> {
        let now = self.clock.now();
        let mut open: Vec<Airdrop> = self
            .lock()?
            .values()
            .filter(|a| a.is_open(now))
            .cloned()
            .collect();
        open.sort_by_key(|a| a.created_at);
        Ok(open)
    }

    /// Claim a slot for `user_id`. Each user collects at most once.
    pub fn reserve(&self, id: Uuid, user_id: &str) -> Result<ReservedShare> {
        validate_user_id(user_id)?;
        let now = self.clock.now();
        let mut airdrops = self.lock()?;
        let airdrop = airdrops
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("airdrop {}", id)))?;

        if airdrop.creator_id == user_id {
            return Err(Error::validation("creators cannot collect their own airdrop"));
        }
        if airdrop.collected_by.contains(user_id) {
            return Err(Error::validation(format!("{} already collected this airdrop", user_id)));
        }
        if !airdrop.is_open(now) {
            Self::close(airdrop, now);
            return Err(Error::validation(format!("airdrop {} has ended", id)));
        }

        airdrop.collected_by.insert(user_id.to_string());
        let remaining_slots = airdrop.remaining_slots();
        if remaining_slots == 0 {
            airdrop.status = AirdropStatus::Completed;
        }
        debug!(airdrop_id = %id, remaining_slots, "airdrop slot reserved");

        Ok(ReservedShare {
            airdrop_id: id,
            creator_id: airdrop.creator_id.clone(),
            currency: airdrop.currency.clone(),
            share: airdrop.share,
            remaining_slots,
        })
    }

    /// Give back a slot whose payout did not happen
    pub fn release(&self, id: Uuid, user_id: &str) -> Result<()> {
        let now = self.clock.now();
        let mut airdrops = self.lock()?;
        if let Some(airdrop) = airdrops.get_mut(&id) {
            if airdrop.collected_by.remove(user_id) && airdrop.status == AirdropStatus::Completed {
                airdrop.status = if now < airdrop.ends_at {
                    AirdropStatus::Active
                } else {
                    AirdropStatus::Expired
                };
            }
        }
        Ok(())
    }

    fn close(airdrop: &mut Airdrop, now: DateTime<Utc>) {
        if airdrop.status == AirdropStatus::Active {
            airdrop.status = if airdrop.remaining_slots() == 0 {
                AirdropStatus::Completed
            } else if now >= airdrop.ends_at {
                AirdropStatus::Expired
            } else {
                airdrop.status
            };
        }
    }

    /// Close airdrops that ran out of time and drop finished ones older
    /// than `retain`. Returns the airdrops closed by this call.
    pub fn close_finished(&self, retain: Duration) -> Result<Vec<Airdrop>> {
        let now = self.clock.now();
        let mut airdrops = self.lock()?;
        let mut closed = Vec::new();
        for airdrop in airdrops.values_mut() {
            let before = airdrop.status;
            Self::close(airdrop, now);
            if before == AirdropStatus::Active && airdrop.status != AirdropStatus::Active {
                closed.push(airdrop.clone());
            }
        }
        airdrops.retain(|_, a| a.status == AirdropStatus::Active || a.ends_at + retain > now);
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::ManualClock;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn book() -> (Arc<ManualClock>, AirdropBook) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (clock.clone(), AirdropBook::new(clock))
    }

    #[test]
    fn test_share_is_floored() {
        let (_, book) = book();
        let airdrop = book
            .create("creator", dec("0.01"), "SOL", 3, Duration::minutes(10), 8)
            .unwrap();
        assert_eq!(airdrop.share, dec("0.00333333"));

        let usdc = book
            .create("creator", dec("1"), "USDC", 3, Duration::minutes(10), 8)
            .unwrap();
        assert_eq!(usdc.share, dec("0.333333"));

        assert!(matches!(
            book.create("creator", dec("0.00001"), "BONK", 10, Duration::minutes(10), 8),
            Err(Error::InvalidAmount(_))
        ));
        assert!(book.create("creator", dec("1"), "SOL", 0, Duration::minutes(10), 8).is_err());
    }

    #[test]
    fn test_collect_once_until_full() {
        let (_, book) = book();
        let airdrop = book
            .create("creator", dec("0.002"), "SOL", 2, Duration::minutes(10), 8)
            .unwrap();

        let first = book.reserve(airdrop.id, "a").unwrap();
        assert_eq!(first.share, dec("0.001"));
        assert_eq!(first.remaining_slots, 1);
        assert!(book.reserve(airdrop.id, "a").is_err());
        assert!(book.reserve(airdrop.id, "creator").is_err());

        book.reserve(airdrop.id, "b").unwrap();
        assert!(book.reserve(airdrop.id, "c").is_err());
        assert_eq!(book.get(airdrop.id).unwrap().unwrap().status, AirdropStatus::Completed);
        assert!(book.active().unwrap().is_empty());
    }

    #[test]
    fn test_release_reopens_slot() {
        let (_, book) = book();
        let airdrop = book
            .create("creator", dec("0.001"), "SOL", 1, Duration::minutes(10), 8)
            .unwrap();
        book.reserve(airdrop.id, "a").unwrap();
        book.release(airdrop.id, "a").unwrap();
        assert_eq!(book.get(airdrop.id).unwrap().unwrap().status, AirdropStatus::Active);
        assert!(book.reserve(airdrop.id, "a").is_ok());
    }

    #[test]
    fn test_expiry_closes_airdrop() {
        let (clock, book) = book();
        let airdrop = book
            .create("creator", dec("0.001"), "SOL", 5, Duration::minutes(10), 8)
            .unwrap();
        clock.advance(Duration::minutes(10));
        assert!(book.reserve(airdrop.id, "a").is_err());

        let other = book
            .create("creator", dec("0.001"), "SOL", 5, Duration::minutes(10), 8)
            .unwrap();
        clock.advance(Duration::minutes(11));
        let closed = book.close_finished(Duration::hours(1)).unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].id, other.id);
        assert_eq!(closed[0].status, AirdropStatus::Expired);

        clock.advance(Duration::hours(2));
        book.close_finished(Duration::hours(1)).unwrap();
        assert!(book.get(airdrop.id).unwrap().is_none());
    }
}
