//! Feed records
//!
//! Value types that exchange decoders emit after pulling frames off the
//! feed sink. The connection core never builds these itself; they live here
//! so every adapter speaks the same shapes.

use crate::ws::transport::Response;
use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

/// Trade or position side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Side {
    Buy = 1,
    Sell = 2,
}

impl Side {
    /// Parse side from exchange bytes (BUY/Buy/buy, SELL/...)
    #[inline]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"BUY" | b"buy" | b"Buy" | b"LONG" | b"long" | b"Long" => Some(Self::Buy),
            b"SELL" | b"sell" | b"Sell" | b"SHORT" | b"short" | b"Short" => Some(Self::Sell),
            _ => None,
        }
    }

    #[inline(always)]
    pub const fn is_buy(&self) -> bool {
        matches!(self, Self::Buy)
    }

    #[inline(always)]
    pub const fn is_sell(&self) -> bool {
        matches!(self, Self::Sell)
    }
}

/// Market an instrument trades in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetType {
    Spot,
    Margin,
    PerpetualSwap,
    Futures,
    Options,
}

impl AssetType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            AssetType::Spot => "spot",
            AssetType::Margin => "margin",
            AssetType::PerpetualSwap => "perpetual_swap",
            AssetType::Futures => "futures",
            AssetType::Options => "options",
        }
    }

    /// Settles periodically through funding rather than at expiry
    pub const fn has_funding(&self) -> bool {
        matches!(self, AssetType::PerpetualSwap)
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "spot" => Ok(AssetType::Spot),
            "margin" => Ok(AssetType::Margin),
            "perpetual_swap" | "perp" | "swap" | "linear" => Ok(AssetType::PerpetualSwap),
            "futures" | "future" => Ok(AssetType::Futures),
            "options" | "option" => Ok(AssetType::Options),
            other => Err(format!("unknown asset type: {}", other)),
        }
    }
}

/// Currency pair, always upper-case
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pair {
    pub base: String,
    pub quote: String,
}

impl Pair {
    pub fn new(base: &str, quote: &str) -> Self {
        Self {
            base: base.to_ascii_uppercase(),
            quote: quote.to_ascii_uppercase(),
        }
    }

    /// Split `BTC-USDT`, `btc_usdt` or `BTC/USDT`
    pub fn from_delimited(symbol: &str) -> Option<Self> {
        let (base, quote) = symbol.split_once(['-', '_', '/'])?;
        if base.is_empty() || quote.is_empty() {
            return None;
        }
        Some(Self::new(base, quote))
    }

    /// Exchange-style concatenated symbol, e.g. `BTCUSDT`
    pub fn symbol(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.base, self.quote)
    }
}

/// Exchange timestamps arrive as Unix milliseconds
pub fn timestamp_from_millis(millis: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()
}

/// Funding rate update
#[derive(Debug, Clone, PartialEq)]
pub struct FundingData {
    pub timestamp: OffsetDateTime,
    pub pair: Pair,
    pub asset_type: AssetType,
    pub exchange: String,
    pub amount: Decimal,
    pub rate: Decimal,
    /// Funding period in hours
    pub period: i64,
    pub side: Side,
}

impl FundingData {
    /// Amount paid (positive) or received (negative) for one period
    pub fn payment(&self) -> Decimal {
        let signed = if self.side.is_buy() { self.amount } else { -self.amount };
        signed * self.rate
    }
}

/// Candlestick update
#[derive(Debug, Clone, PartialEq)]
pub struct KlineData {
    pub timestamp: OffsetDateTime,
    pub pair: Pair,
    pub asset_type: AssetType,
    pub exchange: String,
    pub start_time: OffsetDateTime,
    pub close_time: OffsetDateTime,
    /// Exchange interval label, e.g. `1m`
    pub interval: String,
    pub open_price: Decimal,
    pub close_price: Decimal,
    pub high_price: Decimal,
    pub low_price: Decimal,
    pub volume: Decimal,
}

impl KlineData {
    /// Candle finished as of `now`
    pub fn is_closed_at(&self, now: OffsetDateTime) -> bool {
        now >= self.close_time
    }

    pub fn is_bullish(&self) -> bool {
        self.close_price > self.open_price
    }

    /// High minus low
    pub fn range(&self) -> Decimal {
        self.high_price - self.low_price
    }

    /// OHLC ordering holds (low <= open/close <= high)
    pub fn is_consistent(&self) -> bool {
        self.low_price <= self.high_price
            && (self.low_price..=self.high_price).contains(&self.open_price)
            && (self.low_price..=self.high_price).contains(&self.close_price)
            && self.start_time <= self.close_time
    }
}

/// Orders or contracts changed on the exchange; details come from a REST refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebsocketPositionUpdated {
    pub timestamp: OffsetDateTime,
    pub pair: Pair,
    pub asset_type: AssetType,
    pub exchange: String,
}

/// A frame no decoder understood
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnhandledMessageWarning {
    pub message: String,
}

impl UnhandledMessageWarning {
    pub fn from_response(frame: &Response) -> Self {
        Self {
            message: String::from_utf8_lossy(&frame.raw).into_owned(),
        }
    }
}

impl fmt::Display for UnhandledMessageWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unhandled message: {}", self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn kline(open: &str, high: &str, low: &str, close: &str) -> KlineData {
        KlineData {
            timestamp: datetime!(2024-03-01 12:00:30 UTC),
            pair: Pair::new("btc", "usdt"),
            asset_type: AssetType::PerpetualSwap,
            exchange: "binance".to_string(),
            start_time: datetime!(2024-03-01 12:00 UTC),
            close_time: datetime!(2024-03-01 12:00:59.999 UTC),
            interval: "1m".to_string(),
            open_price: dec(open),
            close_price: dec(close),
            high_price: dec(high),
            low_price: dec(low),
            volume: dec("12.5"),
        }
    }

    #[test]
    fn test_side_parsing() {
        assert_eq!(Side::from_bytes(b"BUY"), Some(Side::Buy));
        assert_eq!(Side::from_bytes(b"Short"), Some(Side::Sell));
        assert_eq!(Side::from_bytes(b"hold"), None);
        assert!(Side::Buy.is_buy());
        assert!(Side::Sell.is_sell());
    }

    #[test]
    fn test_pair_forms() {
        let pair = Pair::from_delimited("btc_usdt").unwrap();
        assert_eq!(pair, Pair::new("BTC", "USDT"));
        assert_eq!(pair.to_string(), "BTC-USDT");
        assert_eq!(pair.symbol(), "BTCUSDT");
        assert!(Pair::from_delimited("BTCUSDT").is_none());
        assert!(Pair::from_delimited("-USDT").is_none());
    }

    #[test]
    fn test_asset_type_names() {
        assert_eq!("linear".parse::<AssetType>(), Ok(AssetType::PerpetualSwap));
        assert_eq!("SPOT".parse::<AssetType>(), Ok(AssetType::Spot));
        assert!("bonds".parse::<AssetType>().is_err());
        assert!(AssetType::PerpetualSwap.has_funding());
        assert_eq!(AssetType::Futures.to_string(), "futures");
    }

    #[test]
    fn test_timestamp_from_millis() {
        assert_eq!(
            timestamp_from_millis(1_709_294_400_000),
            Some(datetime!(2024-03-01 12:00 UTC))
        );
    }

    #[test]
    fn test_funding_payment_sign() {
        let mut funding = FundingData {
            timestamp: datetime!(2024-03-01 08:00 UTC),
            pair: Pair::new("ETH", "USDT"),
            asset_type: AssetType::PerpetualSwap,
            exchange: "bybit".to_string(),
            amount: dec("2"),
            rate: dec("0.0001"),
            period: 8,
            side: Side::Buy,
        };
        assert_eq!(funding.payment(), dec("0.0002"));
        funding.side = Side::Sell;
        assert_eq!(funding.payment(), dec("-0.0002"));
    }

    #[test]
    fn test_kline_helpers() {
        let candle = kline("100", "110", "95", "105");
        assert!(candle.is_bullish());
        assert_eq!(candle.range(), dec("15"));
        assert!(candle.is_consistent());
        assert!(!candle.is_closed_at(datetime!(2024-03-01 12:00:30 UTC)));
        assert!(candle.is_closed_at(datetime!(2024-03-01 12:01 UTC)));

        assert!(!kline("100", "99", "95", "98").is_consistent());
    }

    #[test]
    fn test_unhandled_warning_from_frame() {
        let frame = Response::text(&br#"{"e":"mystery"}"#[..]);
        let warning = UnhandledMessageWarning::from_response(&frame);
        assert_eq!(warning.message, r#"{"e":"mystery"}"#);
        assert!(warning.to_string().starts_with("unhandled message"));
    }
}
