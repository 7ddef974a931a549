//! Supported token registry

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use super::result::{Error, Result};

/// Symbol of the chain's native currency
pub const NATIVE_SYMBOL: &str = "SOL";

/// A token the ledger can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenInfo {
    pub symbol: &'static str,
    pub mint: &'static str,
    pub decimals: u32,
}

pub const TOKENS: &[TokenInfo] = &[
    TokenInfo {
        symbol: "SOL",
        mint: "So11111111111111111111111111111111111111112",
        decimals: 9,
    },
    TokenInfo {
        symbol: "USDC",
        mint: "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
        decimals: 6,
    },
    TokenInfo {
        symbol: "USDT",
        mint: "Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB",
        decimals: 6,
    },
    TokenInfo {
        symbol: "BONK",
        mint: "DezXAZ8z7PnrnRJjz3wXBoRgixCa6xjnB7YaB1pPB263",
        decimals: 5,
    },
    TokenInfo {
        symbol: "JTO",
        mint: "jtojtomepa8beP8AuQc6eXt5FriJwfFMwQx2v2f9mCL",
        decimals: 9,
    },
    TokenInfo {
        symbol: "PYTH",
        mint: "HZ1JovNiVvGrGNiiYvEozEVgZ58xaU3RKwX8eACQBCt3",
        decimals: 6,
    },
];

/// Look up a token by symbol (case-insensitive)
pub fn lookup(code: &str) -> Result<&'static TokenInfo> {
    let code = code.trim();
    TOKENS
        .iter()
        .find(|t| t.symbol.eq_ignore_ascii_case(code))
        .ok_or_else(|| Error::UnsupportedCurrency(code.to_string()))
}

/// Normalize a currency code to its canonical symbol
pub fn normalize_currency(code: &str) -> Result<&'static str> {
    lookup(code).map(|t| t.symbol)
}

pub fn native() -> &'static TokenInfo {
    &TOKENS[0]
}

impl TokenInfo {
    pub fn is_native(&self) -> bool {
        self.symbol == NATIVE_SYMBOL
    }

    /// Check an amount is positive and representable in this token's precision
    pub fn validate_amount(&self, amount: Decimal) -> Result<()> {
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount(format!(
                "{} must be positive",
                amount
            )));
        }
        if amount.normalize().scale() > self.decimals {
            return Err(Error::InvalidAmount(format!(
                "{} has more than {} decimal places for {}",
                amount, self.decimals, self.symbol
            )));
        }
        Ok(())
    }

    /// Truncate toward zero at `places`, never finer than the token allows
    pub fn floor_to(&self, amount: Decimal, places: u32) -> Decimal {
        amount
            .round_dp_with_strategy(places.min(self.decimals), RoundingStrategy::ToZero)
            .normalize()
    }

    /// Convert a display amount into the smallest on-chain unit
    pub fn to_base_units(&self, amount: Decimal) -> Result<u64> {
        let scaled = amount * Decimal::from(10u64.pow(self.decimals));
        scaled
            .trunc()
            .to_u64()
            .ok_or_else(|| Error::InvalidAmount(format!("{} overflows {}", amount, self.symbol)))
    }

    pub fn from_base_units(&self, units: u64) -> Decimal {
        Decimal::from_i128_with_scale(units as i128, self.decimals).normalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        assert_eq!(lookup("usdc").unwrap().symbol, "USDC");
        assert_eq!(normalize_currency(" bonk ").unwrap(), "BONK");
        assert!(lookup("SOL").unwrap().is_native());
    }

    #[test]
    fn test_unknown_currency() {
        assert!(matches!(lookup("DOGE"), Err(Error::UnsupportedCurrency(c)) if c == "DOGE"));
    }

    #[test]
    fn test_validate_amount() {
        let usdc = lookup("USDC").unwrap();
        assert!(usdc.validate_amount(dec("1.5")).is_ok());
        assert!(usdc.validate_amount(dec("1.500000000")).is_ok());
        assert!(matches!(usdc.validate_amount(dec("0")), Err(Error::InvalidAmount(_))));
        assert!(matches!(usdc.validate_amount(dec("-2")), Err(Error::InvalidAmount(_))));
        assert!(matches!(
            usdc.validate_amount(dec("0.0000001")),
            Err(Error::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_base_units() {
        let bonk = lookup("BONK").unwrap();
        assert_eq!(bonk.to_base_units(dec("1.23456")).unwrap(), 123456);
        assert_eq!(bonk.from_base_units(123456), dec("1.23456"));
        assert_eq!(native().to_base_units(dec("0.01")).unwrap(), 10_000_000);
    }

    #[test]
    fn test_floor_respects_token_precision() {
        let usdc = lookup("USDC").unwrap();
        assert_eq!(usdc.floor_to(dec("0.123456789"), 8), dec("0.123456"));
        assert_eq!(native().floor_to(dec("0.123456789"), 8), dec("0.12345678"));
    }
}
