use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsCounter {
    pub messages: u64,
    pub attachments: u64,
}

impl StatsCounter {
    fn add(&mut self, other: StatsCounter) {
        self.messages += other.messages;
        self.attachments += other.attachments;
    }
}

/// Map that remembers the order in which keys were first inserted.
#[derive(Debug, Clone)]
pub struct OrderedMap<V> {
    index: HashMap<String, usize>,
    entries: Vec<(String, V)>,
}

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        Self {
            index: HashMap::new(),
            entries: Vec::new(),
        }
    }
}

impl<V: Default> OrderedMap<V> {
    pub fn get_or_insert_default(&mut self, key: &str) -> &mut V {
        let slot = match self.index.get(key) {
            Some(&slot) => slot,
            None => {
                let slot = self.entries.len();
                self.entries.push((key.to_string(), V::default()));
                self.index.insert(key.to_string(), slot);
                slot
            }
        };
        &mut self.entries[slot].1
    }
}

impl<V> OrderedMap<V> {
    pub fn get(&self, key: &str) -> Option<&V> {
        self.index.get(key).map(|&slot| &self.entries[slot].1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-channel, per-user and per-user-per-channel counters for one run.
///
/// Every increment is applied to all three tiers, so their totals always agree.
#[derive(Debug, Clone, Default)]
pub struct StatsAggregator {
    channels: OrderedMap<StatsCounter>,
    users: OrderedMap<StatsCounter>,
    user_channels: OrderedMap<OrderedMap<StatsCounter>>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_message(&mut self, channel: &str, author: &str) {
        self.apply(
            channel,
            author,
            StatsCounter {
                messages: 1,
                attachments: 0,
            },
        );
    }

    pub fn increment_attachment(&mut self, channel: &str, author: &str) {
        self.apply(
            channel,
            author,
            StatsCounter {
                messages: 0,
                attachments: 1,
            },
        );
    }

    fn apply(&mut self, channel: &str, author: &str, delta: StatsCounter) {
        self.channels.get_or_insert_default(channel).add(delta);
        self.users.get_or_insert_default(author).add(delta);
        self.user_channels
            .get_or_insert_default(author)
            .get_or_insert_default(channel)
            .add(delta);
    }

    pub fn channels(&self) -> &OrderedMap<StatsCounter> {
        &self.channels
    }

    pub fn users(&self) -> &OrderedMap<StatsCounter> {
        &self.users
    }

    pub fn user_channels(&self) -> &OrderedMap<OrderedMap<StatsCounter>> {
        &self.user_channels
    }

    /// Totals of each tier: (channels, users, user-channels).
    pub fn totals(&self) -> (StatsCounter, StatsCounter, StatsCounter) {
        let mut by_channel = StatsCounter::default();
        for (_, c) in self.channels.iter() {
            by_channel.add(*c);
        }
        let mut by_user = StatsCounter::default();
        for (_, c) in self.users.iter() {
            by_user.add(*c);
        }
        let mut by_user_channel = StatsCounter::default();
        for (_, channels) in self.user_channels.iter() {
            for (_, c) in channels.iter() {
                by_user_channel.add(*c);
            }
        }
        (by_channel, by_user, by_user_channel)
    }

    pub fn render_report(&self) -> String {
        let mut out = String::new();
        out.push_str("Channel Statistics:\n");
        for (channel, c) in self.channels.iter() {
            push_counter_line(&mut out, "", channel_label(channel), c);
        }

        out.push_str("\nUser Statistics:\n");
        for (user, c) in self.users.iter() {
            push_counter_line(&mut out, "", user, c);
        }

        out.push_str("\nUser-Channel Statistics:\n");
        for (user, channels) in self.user_channels.iter() {
            let _ = writeln!(out, "{user}:");
            for (channel, c) in channels.iter() {
                push_counter_line(&mut out, "  ", channel_label(channel), c);
            }
        }
        out
    }

    /// Writes the report, replacing any previous one.
    pub fn flush(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.render_report())?;
        Ok(())
    }
}

fn push_counter_line(out: &mut String, indent: &str, label: &str, c: &StatsCounter) {
    let _ = writeln!(
        out,
        "{indent}{label}: Messages - {}, Attachments - {}",
        c.messages, c.attachments
    );
}

// Keys may be full channel directory paths; the report shows the last segment.
fn channel_label(key: &str) -> &str {
    key.rsplit(['/', '\\']).next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_keeps_first_insertion_order() {
        let mut stats = StatsAggregator::new();
        stats.increment_message("zeta", "bob");
        stats.increment_attachment("alpha", "alice");
        stats.increment_message("alpha", "alice");
        stats.increment_message("zeta", "alice");

        let report = stats.render_report();
        let expected = "\
Channel Statistics:
zeta: Messages - 2, Attachments - 0
alpha: Messages - 1, Attachments - 1

User Statistics:
bob: Messages - 1, Attachments - 0
alice: Messages - 2, Attachments - 1

User-Channel Statistics:
bob:
  zeta: Messages - 1, Attachments - 0
alice:
  alpha: Messages - 1, Attachments - 1
  zeta: Messages - 1, Attachments - 0
";
        assert_eq!(report, expected);
    }

    #[test]
    fn tiers_always_agree() {
        let mut stats = StatsAggregator::new();
        let events = [
            ("general", "a", true),
            ("general", "b", false),
            ("random", "a", true),
            ("random", "c", true),
            ("memes", "b", false),
        ];
        for (channel, user, attach) in events {
            stats.increment_message(channel, user);
            if attach {
                stats.increment_attachment(channel, user);
            }
        }

        let (c, u, uc) = stats.totals();
        assert_eq!(c, u);
        assert_eq!(u, uc);
        assert_eq!(c.messages, 5);
        assert_eq!(c.attachments, 3);
    }

    #[test]
    fn path_keys_report_last_segment() {
        let mut stats = StatsAggregator::new();
        stats.increment_message("server_backup_x/general", "a");
        assert!(stats.render_report().contains("\ngeneral: Messages - 1"));
        assert!(stats.channels().get("server_backup_x/general").is_some());
    }
}
