use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Subscribable topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Topic {
    MarketPrice,
    NumOffers,
    Offers,
    Trades,
    TradeProperties,
    TradeStateByTradeId,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::MarketPrice,
        Topic::NumOffers,
        Topic::Offers,
        Topic::Trades,
        Topic::TradeProperties,
        Topic::TradeStateByTradeId,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::MarketPrice => "MARKET_PRICE",
            Topic::NumOffers => "NUM_OFFERS",
            Topic::Offers => "OFFERS",
            Topic::Trades => "TRADES",
            Topic::TradeProperties => "TRADE_PROPERTIES",
            Topic::TradeStateByTradeId => "TRADE_STATE_BY_TRADE_ID",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| format!("Unknown topic: {s}"))
    }
}

/// Kind of change carried by an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModificationType {
    Added,
    Removed,
    Replace,
}
