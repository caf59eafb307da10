//! Listeners that turn the frame stream into live state.
//!
//! Both aggregators are independent listeners on the same
//! [`MessageBus`](crate::bus::MessageBus) and parse frames themselves:
//!
//! - [`counter`]: one count per registered topic prefix.
//! - [`inventory`]: ordered SKU set with a three-field record per SKU.

pub mod counter;
pub mod inventory;

pub use counter::{CounterAggregator, CounterSnapshot, MatchMode, TopicCounter};
pub use inventory::{
    BarPoint, BarSeries, FrameOutcome, InventoryAggregator, InventoryRecord, InventorySnapshot,
    InventoryState, InventoryStats, QuantityPolicy, Sku, SkuEntry,
};
