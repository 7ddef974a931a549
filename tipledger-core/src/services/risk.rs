//! Risk gate - per-user limits, cooldowns and a heuristic risk score
//!
//! State lives for the life of the process. Each user's daily counters roll
//! over on the first access of a new day (in the configured UTC offset),
//! under the same lock that reads them.
//!
//! `reserve` checks and holds quota in one step; the caller then `settle`s
//! the reservation. While a reservation is open its amount counts against
//! the daily limit and the type is treated as in cooldown.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::domain::result::{Error, Result};
use crate::domain::risk::HighRiskUser;
use crate::domain::{BlockDecision, LimitCheck, RiskLimits, RiskReport, TransactionType};
use crate::ports::Clock;

/// Window for the rapid-succession rule
const RECENT_WINDOW_MINUTES: i64 = 5;

/// Recent timestamps kept per user; only the last few minutes matter
const RECENT_CAPACITY: usize = 16;

#[derive(Debug, Default)]
struct DailyCounters {
    volume: HashMap<TransactionType, Decimal>,
    count: HashMap<TransactionType, u32>,
}

impl DailyCounters {
    fn volume(&self, tx_type: TransactionType) -> Decimal {
        self.volume.get(&tx_type).copied().unwrap_or_default()
    }

    fn total_count(&self) -> u32 {
        self.count.values().sum()
    }
}

#[derive(Debug)]
struct RiskProfile {
    day: NaiveDate,
    daily: DailyCounters,
    /// Survives the day rollover so cooldowns span midnight
    last_activity: HashMap<TransactionType, DateTime<Utc>>,
    recent: VecDeque<DateTime<Utc>>,
    /// Open reservations per type: held amount and count
    reserved: HashMap<TransactionType, (Decimal, u32)>,
}

impl RiskProfile {
    fn new(day: NaiveDate) -> Self {
        Self {
            day,
            daily: DailyCounters::default(),
            last_activity: HashMap::new(),
            recent: VecDeque::with_capacity(RECENT_CAPACITY),
            reserved: HashMap::new(),
        }
    }

    fn held(&self, tx_type: TransactionType) -> (Decimal, u32) {
        self.reserved.get(&tx_type).copied().unwrap_or_default()
    }

    fn release(&mut self, tx_type: TransactionType, amount: Decimal) {
        if let Some((held, open)) = self.reserved.get_mut(&tx_type) {
            *held -= amount;
            *open = open.saturating_sub(1);
            if *open == 0 {
                self.reserved.remove(&tx_type);
            }
        }
    }

    fn roll_to(&mut self, day: NaiveDate) {
        if self.day != day {
            self.day = day;
            self.daily = DailyCounters::default();
        }
    }

    fn score(&self, now: DateTime<Utc>) -> u32 {
        let mut score = 0;
        if self.daily.total_count() > 5 {
            score += 3;
        }
        if self.daily.volume(TransactionType::Withdraw) > Decimal::new(2, 2) {
            score += 2;
        }
        if self.daily.volume(TransactionType::Tip) > Decimal::new(5, 2) {
            score += 1;
        }
        let window_start = now - Duration::minutes(RECENT_WINDOW_MINUTES);
        if self.recent.iter().filter(|t| **t > window_start).count() > 2 {
            score += 2;
        }
        score
    }
}

#[derive(Debug)]
struct DailyTotals {
    day: NaiveDate,
    volume: HashMap<TransactionType, Decimal>,
    active_users: HashSet<String>,
}

impl DailyTotals {
    fn new(day: NaiveDate) -> Self {
        Self {
            day,
            volume: HashMap::new(),
            active_users: HashSet::new(),
        }
    }
}

#[derive(Debug)]
struct RiskState {
    profiles: HashMap<String, RiskProfile>,
    totals: DailyTotals,
}

pub struct RiskGate {
    limits: RiskLimits,
    offset: FixedOffset,
    clock: Arc<dyn Clock>,
    state: Mutex<RiskState>,
}

impl RiskGate {
    pub fn new(limits: RiskLimits, utc_offset_minutes: i32, clock: Arc<dyn Clock>) -> Result<Self> {
        let offset = FixedOffset::east_opt(utc_offset_minutes * 60)
            .ok_or_else(|| Error::config(format!("invalid UTC offset {}", utc_offset_minutes)))?;
        let today = clock.now().with_timezone(&offset).date_naive();
        Ok(Self {
            limits,
            offset,
            clock,
            state: Mutex::new(RiskState {
                profiles: HashMap::new(),
                totals: DailyTotals::new(today),
            }),
        })
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    fn lock(&self) -> Result<MutexGuard<'_, RiskState>> {
        self.state
            .lock()
            .map_err(|_| Error::database("risk state lock poisoned"))
    }

    fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.offset).date_naive()
    }

    /// Check every limit for a prospective transaction. All violations are reported.
    pub fn check_limits(
        &self,
        user_id: &str,
        tx_type: TransactionType,
        amount: Decimal,
    ) -> Result<LimitCheck> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        Ok(self.evaluate(self.profile(&mut state, user_id, now), tx_type, amount, now))
    }

    fn evaluate(
        &self,
        profile: &RiskProfile,
        tx_type: TransactionType,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> LimitCheck {
        let limits = self.limits.for_type(tx_type);
        let mut reasons = Vec::new();

        if amount > limits.max_per_transaction {
            reasons.push(format!(
                "Amount exceeds maximum {} limit of {}",
                tx_type, limits.max_per_transaction
            ));
        }

        let (held, open) = profile.held(tx_type);
        let daily = profile.daily.volume(tx_type) + held;
        if daily + amount > limits.daily_limit {
            reasons.push(format!(
                "Daily {} limit exceeded ({}, {} used)",
                tx_type, limits.daily_limit, daily
            ));
        }

        let cooldown = Duration::minutes(limits.cooldown_minutes);
        let in_flight = open > 0 && limits.cooldown_minutes > 0;
        let recent = profile
            .last_activity
            .get(&tx_type)
            .is_some_and(|last| now - *last < cooldown);
        if in_flight || recent {
            reasons.push(format!(
                "{} cooldown active ({} minutes)",
                tx_type, limits.cooldown_minutes
            ));
        }

        LimitCheck {
            ok: reasons.is_empty(),
            reasons,
        }
    }

    /// Record a finished transaction. Failed attempts change nothing.
    pub fn record_outcome(
        &self,
        user_id: &str,
        tx_type: TransactionType,
        amount: Decimal,
        success: bool,
    ) -> Result<()> {
        if !success {
            return Ok(());
        }
        let now = self.clock.now();
        let mut state = self.lock()?;
        self.record(&mut state, user_id, tx_type, amount, now);
        Ok(())
    }

    fn record(
        &self,
        state: &mut RiskState,
        user_id: &str,
        tx_type: TransactionType,
        amount: Decimal,
        now: DateTime<Utc>,
    ) {
        let today = self.today(now);
        let profile = state
            .profiles
            .entry(user_id.to_string())
            .or_insert_with(|| RiskProfile::new(today));
        profile.roll_to(today);
        *profile.daily.volume.entry(tx_type).or_default() += amount;
        *profile.daily.count.entry(tx_type).or_default() += 1;
        profile.last_activity.insert(tx_type, now);
        if profile.recent.len() == RECENT_CAPACITY {
            profile.recent.pop_front();
        }
        profile.recent.push_back(now);
        let score = profile.score(now);

        if state.totals.day != today {
            state.totals = DailyTotals::new(today);
        }
        *state.totals.volume.entry(tx_type).or_default() += amount;
        state.totals.active_users.insert(user_id.to_string());

        debug!(user_id, tx_type = tx_type.as_str(), score, "recorded risk activity");
    }

    pub fn risk_score(&self, user_id: &str) -> Result<u32> {
        let now = self.clock.now();
        let today = self.today(now);
        let mut state = self.lock()?;
        Ok(match state.profiles.get_mut(user_id) {
            Some(profile) => {
                profile.roll_to(today);
                profile.score(now)
            }
            None => 0,
        })
    }

    /// Limits first, then the risk score. Holds nothing.
    pub fn should_block(
        &self,
        user_id: &str,
        tx_type: TransactionType,
        amount: Decimal,
    ) -> Result<BlockDecision> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        Ok(self.decide(self.profile(&mut state, user_id, now), user_id, tx_type, amount, now))
    }

    /// Like `should_block`, but an admitted amount is held against the
    /// user's limits until `settle` is called for it
    pub fn reserve(
        &self,
        user_id: &str,
        tx_type: TransactionType,
        amount: Decimal,
    ) -> Result<BlockDecision> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let profile = self.profile(&mut state, user_id, now);
        let decision = self.decide(profile, user_id, tx_type, amount, now);
        if !decision.block {
            let held = profile.reserved.entry(tx_type).or_default();
            held.0 += amount;
            held.1 += 1;
        }
        Ok(decision)
    }

    /// Close a reservation, recording it as activity if the transaction went through
    pub fn settle(
        &self,
        user_id: &str,
        tx_type: TransactionType,
        amount: Decimal,
        success: bool,
    ) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        if let Some(profile) = state.profiles.get_mut(user_id) {
            profile.release(tx_type, amount);
        }
        if success {
            self.record(&mut state, user_id, tx_type, amount, now);
        }
        Ok(())
    }

    fn profile<'a>(
        &self,
        state: &'a mut RiskState,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> &'a mut RiskProfile {
        let today = self.today(now);
        let profile = state
            .profiles
            .entry(user_id.to_string())
            .or_insert_with(|| RiskProfile::new(today));
        profile.roll_to(today);
        profile
    }

    fn decide(
        &self,
        profile: &RiskProfile,
        user_id: &str,
        tx_type: TransactionType,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> BlockDecision {
        let check = self.evaluate(profile, tx_type, amount, now);
        let score = profile.score(now);
        if !check.ok {
            return BlockDecision {
                block: true,
                reasons: check.reasons,
                score,
            };
        }

        if score > self.limits.block_score_threshold {
            warn!(user_id, score, "blocking high risk user");
            return BlockDecision {
                block: true,
                reasons: vec![format!(
                    "High risk score: {}. Manual review required.",
                    score
                )],
                score,
            };
        }

        BlockDecision {
            block: false,
            reasons: Vec::new(),
            score,
        }
    }

    /// Totals for the current day and users above the high-risk score
    pub fn daily_report(&self) -> Result<RiskReport> {
        let now = self.clock.now();
        let today = self.today(now);
        let mut state = self.lock()?;
        if state.totals.day != today {
            state.totals = DailyTotals::new(today);
        }

        let mut high_risk_users: Vec<HighRiskUser> = state
            .profiles
            .iter_mut()
            .filter_map(|(user_id, profile)| {
                profile.roll_to(today);
                let score = profile.score(now);
                (score > self.limits.high_risk_score).then(|| HighRiskUser {
                    user_id: user_id.clone(),
                    score,
                })
            })
            .collect();
        high_risk_users.sort_by(|a, b| b.score.cmp(&a.score).then(a.user_id.cmp(&b.user_id)));

        let volume = |t: TransactionType| state.totals.volume.get(&t).copied().unwrap_or_default();
        Ok(RiskReport {
            day: today,
            active_users: state.totals.active_users.len(),
            total_tips: volume(TransactionType::Tip),
            total_withdraws: volume(TransactionType::Withdraw),
            total_airdrops: volume(TransactionType::Airdrop),
            high_risk_users,
        })
    }
}
