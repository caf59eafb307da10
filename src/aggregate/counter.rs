//! Per-topic frame counters.
//!
//! A counter matches on the raw frame text, not on the decoded topic field:
//! prefix `orders` also counts `orders-archived:...`. [`MatchMode::TopicField`]
//! is available for hosts that want an exact topic match instead.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::bus::{MessageBus, Subscription};
use crate::error::{Error, Result};
use crate::parser;
use crate::protocol::Topic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchMode {
    /// Plain case-sensitive `starts_with` on the whole frame.
    #[default]
    RawPrefix,
    /// Field 0 must equal the prefix exactly.
    TopicField,
}

impl MatchMode {
    pub fn matches(self, frame: &str, prefix: &str) -> bool {
        match self {
            MatchMode::RawPrefix => parser::has_prefix(frame, prefix),
            MatchMode::TopicField => parser::decode(frame).topic() == prefix,
        }
    }
}

impl FromStr for MatchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "raw-prefix" => Ok(Self::RawPrefix),
            "topic-field" => Ok(Self::TopicField),
            other => Err(Error::Config(format!(
                "unknown match mode {other:?} (expected raw-prefix or topic-field)"
            ))),
        }
    }
}

/// One live counter bound to a bus listener.
pub struct TopicCounter {
    prefix: Arc<str>,
    count: Arc<AtomicU64>,
    subscription: Subscription,
}

impl TopicCounter {
    /// Counts frames whose raw text starts with `prefix`.
    pub fn register(bus: &MessageBus, prefix: impl Into<String>) -> Self {
        Self::register_with(bus, prefix, MatchMode::RawPrefix, |_| {})
    }

    /// Like [`register`](Self::register) with an explicit match mode and an
    /// observer called with the new value after every increment.
    pub fn register_with<F>(
        bus: &MessageBus,
        prefix: impl Into<String>,
        mode: MatchMode,
        mut on_change: F,
    ) -> Self
    where
        F: FnMut(u64) + Send + 'static,
    {
        let prefix: Arc<str> = Arc::from(prefix.into());
        let count = Arc::new(AtomicU64::new(0));

        let listener_prefix = Arc::clone(&prefix);
        let listener_count = Arc::clone(&count);
        let subscription = bus.add_listener(move |frame| {
            if mode.matches(frame, &listener_prefix) {
                let value = listener_count.fetch_add(1, Ordering::Relaxed) + 1;
                on_change(value);
            }
            Ok(())
        });
        debug!("counter {:?} registered as listener {}", &*prefix, subscription.id());

        Self {
            prefix,
            count,
            subscription,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn value(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_active(&self) -> bool {
        self.subscription.is_active()
    }

    /// Stops counting and returns the final value.
    pub fn cancel(self) -> u64 {
        self.subscription.cancel();
        self.count.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for TopicCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicCounter")
            .field("prefix", &self.prefix)
            .field("value", &self.value())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub prefix: String,
    pub count: u64,
}

/// The set of counters a host displays, in registration order.
#[derive(Debug)]
pub struct CounterAggregator {
    bus: MessageBus,
    counters: Vec<TopicCounter>,
}

impl CounterAggregator {
    pub fn new(bus: &MessageBus) -> Self {
        Self {
            bus: bus.clone(),
            counters: Vec::new(),
        }
    }

    /// Registers the `orders` and `shipments` counters.
    pub fn with_default_topics(bus: &MessageBus) -> Self {
        let mut aggregator = Self::new(bus);
        for topic in Topic::COUNTED {
            aggregator.register(topic.as_str());
        }
        aggregator
    }

    /// Adds a counter. Registering the same prefix twice yields two
    /// independent counters.
    pub fn register(&mut self, prefix: impl Into<String>) -> &TopicCounter {
        self.register_with_mode(prefix, MatchMode::RawPrefix)
    }

    pub fn register_with_mode(&mut self, prefix: impl Into<String>, mode: MatchMode) -> &TopicCounter {
        let counter = TopicCounter::register_with(&self.bus, prefix, mode, |_| {});
        self.counters.push(counter);
        &self.counters[self.counters.len() - 1]
    }

    /// Value of the first counter registered for `prefix`.
    pub fn value(&self, prefix: &str) -> Option<u64> {
        self.counters
            .iter()
            .find(|counter| counter.prefix() == prefix)
            .map(TopicCounter::value)
    }

    pub fn counters(&self) -> &[TopicCounter] {
        &self.counters
    }

    pub fn snapshot(&self) -> Vec<CounterSnapshot> {
        self.counters
            .iter()
            .map(|counter| CounterSnapshot {
                prefix: counter.prefix().to_string(),
                count: counter.value(),
            })
            .collect()
    }

    /// Cancels every counter and returns their final values.
    pub fn detach(self) -> Vec<CounterSnapshot> {
        let snapshot = self.snapshot();
        for counter in self.counters {
            counter.cancel();
        }
        snapshot
    }
}
