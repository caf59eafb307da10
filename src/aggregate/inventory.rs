//! Per-SKU inventory aggregation.
//!
//! Three topics feed one record per SKU, each touching exactly one field:
//!
//! | topic             | field             | rule        |
//! |-------------------|-------------------|-------------|
//! | `stock-levels`    | `stock_level`     | overwrite   |
//! | `reserved-stock`  | `reserved_stock`  | accumulate  |
//! | `available-stock` | `available_stock` | overwrite   |
//!
//! SKUs are kept in first-seen order and never removed. A record starts at
//! zero in all three fields and is created before the triggering quantity is
//! applied.
//!
//! Every frame goes through one merge function ([`InventoryState::apply`]);
//! the aggregator registers a single bus listener regardless of how many SKUs
//! it discovers.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use serde::{Deserialize, Serialize, Serializer};

use crate::bus::{lock, MessageBus, Subscription};
use crate::error::{Error, FrameError, Result};
use crate::parser::{self, Fields};
use crate::protocol::Topic;

/// Quantity and shape validation applied before a frame mutates state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuantityPolicy {
    /// Reject malformed frames and unparsable quantities without mutating
    /// anything.
    #[default]
    Strict,
    /// Pass everything through: a missing SKU becomes the `undefined` key and
    /// bad quantities become `NaN`, which sticks in the reserved accumulator.
    Legacy,
}

impl FromStr for QuantityPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "strict" => Ok(Self::Strict),
            "legacy" => Ok(Self::Legacy),
            other => Err(Error::Config(format!(
                "unknown quantity policy {other:?} (expected strict or legacy)"
            ))),
        }
    }
}

impl fmt::Display for QuantityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Strict => "strict",
            Self::Legacy => "legacy",
        })
    }
}

/// Aggregation key. `Sku::ABSENT` stands for a frame with no SKU field and
/// only appears under [`QuantityPolicy::Legacy`]; it is distinct from the
/// empty-string SKU.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Sku(Option<String>);

impl Sku {
    pub const ABSENT: Sku = Sku(None);

    pub fn new(name: impl Into<String>) -> Self {
        Sku(Some(name.into()))
    }

    fn from_field(field: Option<&str>) -> Self {
        Sku(field.map(str::to_string))
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn is_absent(&self) -> bool {
        self.0.is_none()
    }
}

impl fmt::Display for Sku {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str().unwrap_or("undefined"))
    }
}

impl From<&str> for Sku {
    fn from(value: &str) -> Self {
        Sku::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct InventoryRecord {
    #[serde(serialize_with = "quantity")]
    pub stock_level: f64,
    #[serde(serialize_with = "quantity")]
    pub reserved_stock: f64,
    #[serde(serialize_with = "quantity")]
    pub available_stock: f64,
}

/// JSON has no NaN or infinity; those are written as the strings the text
/// report prints (`"NaN"`, `"inf"`, `"-inf"`) instead of `null`.
fn quantity<S: Serializer>(value: &f64, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    if value.is_finite() {
        serializer.serialize_f64(*value)
    } else {
        serializer.collect_str(value)
    }
}

impl InventoryRecord {
    /// Folds `value` into the field owned by `topic`. Counted topics are a
    /// no-op.
    pub fn apply(&mut self, topic: Topic, value: f64) {
        match topic {
            Topic::StockLevels => self.stock_level = value,
            Topic::ReservedStock => self.reserved_stock += value,
            Topic::AvailableStock => self.available_stock = value,
            Topic::Orders | Topic::Shipments => {}
        }
    }

    /// True once any field holds `NaN`.
    pub fn is_poisoned(&self) -> bool {
        self.stock_level.is_nan() || self.reserved_stock.is_nan() || self.available_stock.is_nan()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Applied { sku: Sku, topic: Topic, new_sku: bool },
    /// Not an inventory topic.
    Ignored,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InventoryStats {
    pub applied: u64,
    pub ignored: u64,
    pub rejected: u64,
}

/// Aggregated inventory, mutated only through [`apply`](Self::apply).
#[derive(Debug, Clone)]
pub struct InventoryState {
    policy: QuantityPolicy,
    skus: Vec<Sku>,
    index: HashMap<Sku, usize>,
    records: Vec<InventoryRecord>,
    stats: InventoryStats,
    revision: u64,
}

impl InventoryState {
    pub fn new(policy: QuantityPolicy) -> Self {
        Self {
            policy,
            skus: Vec::new(),
            index: HashMap::new(),
            records: Vec::new(),
            stats: InventoryStats::default(),
            revision: 0,
        }
    }

    pub fn policy(&self) -> QuantityPolicy {
        self.policy
    }

    /// Merges one raw frame.
    ///
    /// # Errors
    ///
    /// Only under [`QuantityPolicy::Strict`]:
    /// - `FrameError::MalformedFrame`: missing or empty SKU, missing quantity
    /// - `FrameError::NumericParseFailure`: quantity is not a finite number, or
    ///   a negative `reserved-stock` increment
    ///
    /// A rejected frame leaves the state untouched apart from the rejection
    /// counter.
    pub fn apply(&mut self, raw: &str) -> std::result::Result<FrameOutcome, FrameError> {
        let fields = parser::decode(raw);
        let Some(topic) = Topic::inventory(fields.topic()) else {
            self.stats.ignored += 1;
            return Ok(FrameOutcome::Ignored);
        };

        let (sku, value) = match self.policy {
            QuantityPolicy::Legacy => (
                Sku::from_field(fields.sku()),
                parser::coerce_quantity(fields.quantity()),
            ),
            QuantityPolicy::Strict => match validate(topic, &fields) {
                Ok(parsed) => parsed,
                Err(err) => {
                    self.stats.rejected += 1;
                    return Err(err);
                }
            },
        };

        let (slot, new_sku) = self.slot(&sku);
        self.records[slot].apply(topic, value);
        self.stats.applied += 1;
        self.revision += 1;
        Ok(FrameOutcome::Applied {
            sku,
            topic,
            new_sku,
        })
    }

    fn slot(&mut self, sku: &Sku) -> (usize, bool) {
        if let Some(&slot) = self.index.get(sku) {
            return (slot, false);
        }
        let slot = self.skus.len();
        self.skus.push(sku.clone());
        self.index.insert(sku.clone(), slot);
        self.records.push(InventoryRecord::default());
        debug!("new sku {sku} at position {slot}");
        (slot, true)
    }

    /// Known SKUs in first-seen order.
    pub fn skus(&self) -> &[Sku] {
        &self.skus
    }

    pub fn record(&self, sku: &str) -> Option<&InventoryRecord> {
        self.record_for(&Sku::new(sku))
    }

    pub fn record_for(&self, sku: &Sku) -> Option<&InventoryRecord> {
        self.index.get(sku).map(|&slot| &self.records[slot])
    }

    pub fn len(&self) -> usize {
        self.skus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skus.is_empty()
    }

    pub fn stats(&self) -> InventoryStats {
        self.stats
    }

    /// Bumped on every applied frame.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn snapshot(&self) -> InventorySnapshot {
        InventorySnapshot {
            revision: self.revision,
            entries: self
                .skus
                .iter()
                .zip(&self.records)
                .map(|(sku, record)| SkuEntry {
                    sku: sku.clone(),
                    record: *record,
                })
                .collect(),
        }
    }
}

fn validate(topic: Topic, fields: &Fields<'_>) -> std::result::Result<(Sku, f64), FrameError> {
    let sku = match fields.sku() {
        Some("") => {
            return Err(FrameError::MalformedFrame(format!("{topic} frame has an empty sku")))
        }
        Some(sku) => sku,
        None => {
            return Err(FrameError::MalformedFrame(format!("{topic} frame has no sku field")))
        }
    };
    let value = parser::parse_quantity(topic.as_str(), fields.quantity())?;
    if topic == Topic::ReservedStock && value < 0.0 {
        return Err(FrameError::NumericParseFailure {
            field: topic.as_str(),
            text: fields.quantity().unwrap_or_default().to_string(),
        });
    }
    Ok((Sku::new(sku), value))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkuEntry {
    pub sku: Sku,
    pub record: InventoryRecord,
}

/// Point-in-time copy of the aggregate, in SKU display order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InventorySnapshot {
    pub revision: u64,
    pub entries: Vec<SkuEntry>,
}

/// One bar of a per-SKU chart group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BarPoint {
    pub label: &'static str,
    #[serde(serialize_with = "quantity")]
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BarSeries {
    pub name: String,
    pub points: [BarPoint; 3],
}

impl InventorySnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn skus(&self) -> impl Iterator<Item = &Sku> + '_ {
        self.entries.iter().map(|entry| &entry.sku)
    }

    pub fn get(&self, sku: &str) -> Option<&InventoryRecord> {
        self.entries
            .iter()
            .find(|entry| entry.sku.as_str() == Some(sku))
            .map(|entry| &entry.record)
    }

    /// SKU names for a chart legend, in display order.
    pub fn legend(&self) -> Vec<String> {
        self.skus().map(Sku::to_string).collect()
    }

    /// Stock / Reserved / Available bars per SKU.
    pub fn bar_series(&self) -> Vec<BarSeries> {
        self.entries
            .iter()
            .map(|entry| BarSeries {
                name: entry.sku.to_string(),
                points: [
                    BarPoint {
                        label: "Stock",
                        value: entry.record.stock_level,
                    },
                    BarPoint {
                        label: "Reserved",
                        value: entry.record.reserved_stock,
                    },
                    BarPoint {
                        label: "Available",
                        value: entry.record.available_stock,
                    },
                ],
            })
            .collect()
    }
}

/// Inventory state attached to a bus as one listener.
pub struct InventoryAggregator {
    state: Arc<Mutex<InventoryState>>,
    subscription: Subscription,
}

impl InventoryAggregator {
    pub fn attach(bus: &MessageBus, policy: QuantityPolicy) -> Self {
        let state = Arc::new(Mutex::new(InventoryState::new(policy)));
        let listener_state = Arc::clone(&state);
        let subscription = bus.add_listener(move |frame| {
            let outcome = lock(&listener_state).apply(frame);
            if let Err(err) = outcome {
                warn!("dropping frame {frame:?}: {err}");
            }
            Ok(())
        });
        debug!(
            "inventory aggregator ({policy}) registered as listener {}",
            subscription.id()
        );
        Self {
            state,
            subscription,
        }
    }

    pub fn policy(&self) -> QuantityPolicy {
        lock(&self.state).policy()
    }

    pub fn skus(&self) -> Vec<Sku> {
        lock(&self.state).skus().to_vec()
    }

    pub fn record(&self, sku: &str) -> Option<InventoryRecord> {
        lock(&self.state).record(sku).copied()
    }

    pub fn snapshot(&self) -> InventorySnapshot {
        lock(&self.state).snapshot()
    }

    pub fn stats(&self) -> InventoryStats {
        lock(&self.state).stats()
    }

    pub fn revision(&self) -> u64 {
        lock(&self.state).revision()
    }

    /// Unregisters from the bus and returns the final state.
    pub fn detach(self) -> InventorySnapshot {
        self.subscription.cancel();
        lock(&self.state).snapshot()
    }
}

impl fmt::Debug for InventoryAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("InventoryAggregator")
            .field("policy", &state.policy())
            .field("skus", &state.len())
            .field("revision", &state.revision())
            .finish()
    }
}
