//! Topic catalogue for the inbound text stream.
//!
//! Frames are `:`-delimited text whose first field names the topic:
//!
//! ```text
//! orders...                          counted by raw prefix
//! shipments...                       counted by raw prefix
//! stock-levels:<sku>:<quantity>      overwrite
//! reserved-stock:<sku>:<quantity>    accumulate
//! available-stock:<sku>:<quantity>   overwrite
//! ```

use std::fmt;
use std::str::FromStr;

/// Field separator of a raw frame.
pub const FIELD_DELIMITER: char = ':';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Orders,
    Shipments,
    StockLevels,
    ReservedStock,
    AvailableStock,
}

/// How an inventory topic folds a quantity into its record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRule {
    /// Last write wins.
    Overwrite,
    /// Running sum.
    Accumulate,
}

impl Topic {
    pub const ALL: [Topic; 5] = [
        Topic::Orders,
        Topic::Shipments,
        Topic::StockLevels,
        Topic::ReservedStock,
        Topic::AvailableStock,
    ];

    /// Topics counted by the dashboard cards.
    pub const COUNTED: [Topic; 2] = [Topic::Orders, Topic::Shipments];

    #[inline]
    pub const fn as_str(self) -> &'static str {
        match self {
            Topic::Orders => "orders",
            Topic::Shipments => "shipments",
            Topic::StockLevels => "stock-levels",
            Topic::ReservedStock => "reserved-stock",
            Topic::AvailableStock => "available-stock",
        }
    }

    /// Resolves an already-decoded topic field to one of the three inventory
    /// topics. `orders` and `shipments` are never matched here; they are
    /// detected by raw prefix.
    pub fn inventory(field: &str) -> Option<Topic> {
        match field {
            "stock-levels" => Some(Topic::StockLevels),
            "reserved-stock" => Some(Topic::ReservedStock),
            "available-stock" => Some(Topic::AvailableStock),
            _ => None,
        }
    }

    pub const fn merge_rule(self) -> Option<MergeRule> {
        match self {
            Topic::StockLevels | Topic::AvailableStock => Some(MergeRule::Overwrite),
            Topic::ReservedStock => Some(MergeRule::Accumulate),
            Topic::Orders | Topic::Shipments => None,
        }
    }

    pub const fn is_inventory(self) -> bool {
        self.merge_rule().is_some()
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
            .ok_or_else(|| format!("unknown topic {s:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_round_trip() {
        for topic in Topic::ALL {
            assert_eq!(topic.as_str().parse::<Topic>().unwrap(), topic);
        }
        assert!("order".parse::<Topic>().is_err());
    }

    #[test]
    fn inventory_lookup_excludes_counted_topics() {
        assert_eq!(Topic::inventory("stock-levels"), Some(Topic::StockLevels));
        assert_eq!(Topic::inventory("orders"), None);
        assert_eq!(Topic::inventory("Stock-Levels"), None);
        assert!(Topic::COUNTED.iter().all(|t| !t.is_inventory()));
    }

    #[test]
    fn only_reserved_stock_accumulates() {
        assert_eq!(Topic::ReservedStock.merge_rule(), Some(MergeRule::Accumulate));
        assert_eq!(Topic::StockLevels.merge_rule(), Some(MergeRule::Overwrite));
        assert_eq!(Topic::AvailableStock.merge_rule(), Some(MergeRule::Overwrite));
    }
}
