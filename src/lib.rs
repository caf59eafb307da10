//! Live order and inventory aggregation over a `:`-delimited topic stream.
//!
//! One connection feeds one [`MessageBus`]; counters and the inventory
//! aggregator are independent listeners on it:
//!
//! ```text
//! WebSocket ──► Connection ──► MessageBus ──┬─► TopicCounter("orders")
//!                                           ├─► TopicCounter("shipments")
//!                                           └─► InventoryAggregator
//! ```
//!
//! # Example
//!
//! ```
//! use stockfeed::{CounterAggregator, InventoryAggregator, MessageBus, QuantityPolicy};
//!
//! let bus = MessageBus::default();
//! let counters = CounterAggregator::with_default_topics(&bus);
//! let inventory = InventoryAggregator::attach(&bus, QuantityPolicy::Strict);
//!
//! for frame in ["orders:1:placed", "stock-levels:A:10", "reserved-stock:A:3"] {
//!     bus.deliver(frame)?;
//! }
//!
//! assert_eq!(counters.value("orders"), Some(1));
//! assert_eq!(inventory.record("A").unwrap().reserved_stock, 3.0);
//! # Ok::<(), stockfeed::Error>(())
//! ```

pub mod aggregate;
pub mod bus;
pub mod config;
pub mod error;
pub mod parser;
pub mod protocol;
#[cfg(feature = "transport")]
pub mod transport;

pub use aggregate::{
    CounterAggregator, InventoryAggregator, InventoryRecord, InventorySnapshot, QuantityPolicy,
    Sku, TopicCounter,
};
pub use bus::{DeliveryPolicy, MessageBus, Subscription};
pub use config::{FeedConfig, ReconnectPolicy};
pub use error::{Error, FrameError, Result};
pub use protocol::Topic;
#[cfg(feature = "transport")]
pub use transport::{Connection, ConnectionState};
