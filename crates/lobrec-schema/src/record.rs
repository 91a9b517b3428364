use serde::{Deserialize, Serialize};

/// One resting price level of a book side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub size: f64,
    pub order_count: u32,
}

impl PriceLevel {
    pub fn new(price: f64, size: f64, order_count: u32) -> Self {
        Self {
            price,
            size,
            order_count,
        }
    }

    /// Finite price, finite non-negative size.
    pub fn is_valid(&self) -> bool {
        self.price.is_finite() && self.size.is_finite() && self.size >= 0.0
    }
}

/// A single order book update as received from the feed.
///
/// Fields are private: an update is never mutated after the codec builds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookUpdate {
    instrument: String,
    channel: String,
    exchange_time: i64,
    local_time: i64,
    bids: Vec<PriceLevel>,
    asks: Vec<PriceLevel>,
}

impl OrderBookUpdate {
    pub fn new(
        instrument: impl Into<String>,
        channel: impl Into<String>,
        exchange_time: i64,
        local_time: i64,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            channel: channel.into(),
            exchange_time,
            local_time,
            bids,
            asks,
        }
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Feed-assigned event time, copied verbatim.
    pub fn exchange_time(&self) -> i64 {
        self.exchange_time
    }

    /// Local receipt time in microseconds since the Unix epoch.
    pub fn local_time(&self) -> i64 {
        self.local_time
    }

    /// Bid levels, best (highest) price first.
    pub fn bids(&self) -> &[PriceLevel] {
        &self.bids
    }

    /// Ask levels, best (lowest) price first.
    pub fn asks(&self) -> &[PriceLevel] {
        &self.asks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_level_validity() {
        assert!(PriceLevel::new(100.0, 0.0, 0).is_valid());
        assert!(!PriceLevel::new(100.0, -1.0, 1).is_valid());
        assert!(!PriceLevel::new(f64::NAN, 1.0, 1).is_valid());
        assert!(!PriceLevel::new(100.0, f64::INFINITY, 1).is_valid());
    }

    #[test]
    fn test_update_accessors() {
        let update = OrderBookUpdate::new(
            "BTC",
            "l2Book",
            1_700_000_000_000,
            1_700_000_000_000_123,
            vec![PriceLevel::new(100.0, 1.0, 2)],
            vec![],
        );
        assert_eq!(update.instrument(), "BTC");
        assert_eq!(update.channel(), "l2Book");
        assert_eq!(update.exchange_time(), 1_700_000_000_000);
        assert_eq!(update.local_time(), 1_700_000_000_000_123);
        assert_eq!(update.bids().len(), 1);
        assert!(update.asks().is_empty());
    }

    #[test]
    fn test_update_serializes_for_digest() {
        let update = OrderBookUpdate::new("ETH", "l2Book", 1, 2, vec![], vec![]);
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains(r#""instrument":"ETH""#));
        assert!(json.contains(r#""bids":[]"#));
    }
}
