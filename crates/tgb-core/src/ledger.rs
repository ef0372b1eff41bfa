//! Per-phone send history derived from the delivery log, and re-send selection.
//!
//! Every successful delivery counts once and moves `last_sent_at` forward. A
//! [`ResendFilter`] then keeps contacts never messaged or not messaged within the
//! window, oldest first, capped at a limit.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::{
    domain::{ContactRecord, DeliveryStatus},
    utils::{DeliveryEntry, DeliveryLog},
    Result,
};

pub const DEFAULT_RESEND_LIMIT: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendRecord {
    pub message_count: u32,
    pub last_sent_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default)]
pub struct SendLedger {
    by_phone: HashMap<String, SendRecord>,
}

impl SendLedger {
    pub fn from_log(log: &DeliveryLog) -> Result<Self> {
        Ok(Self::from_entries(log.entries()?))
    }

    pub fn from_entries(entries: impl IntoIterator<Item = DeliveryEntry>) -> Self {
        let mut ledger = Self::default();
        for entry in entries {
            if entry.status != DeliveryStatus::Success.as_str() {
                continue;
            }
            match DateTime::parse_from_rfc3339(&entry.timestamp) {
                Ok(at) => ledger.note_success(&entry.phone, at.with_timezone(&Utc)),
                Err(e) => tracing::warn!(phone = %entry.phone, "bad delivery timestamp: {e}"),
            }
        }
        ledger
    }

    pub fn note_success(&mut self, phone: &str, at: DateTime<Utc>) {
        self.by_phone
            .entry(phone.to_string())
            .and_modify(|r| {
                r.message_count += 1;
                r.last_sent_at = r.last_sent_at.max(at);
            })
            .or_insert(SendRecord {
                message_count: 1,
                last_sent_at: at,
            });
    }

    pub fn get(&self, phone: &str) -> Option<&SendRecord> {
        self.by_phone.get(phone)
    }

    pub fn len(&self) -> usize {
        self.by_phone.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_phone.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResendFilter {
    pub not_sent_within: chrono::Duration,
    pub limit: usize,
}

impl ResendFilter {
    pub fn new(days: u32, limit: Option<usize>) -> Self {
        Self {
            not_sent_within: chrono::Duration::days(i64::from(days)),
            limit: limit.unwrap_or(DEFAULT_RESEND_LIMIT),
        }
    }

    /// Contacts due for a message at `now`: never sent first, then oldest send first.
    pub fn select(
        &self,
        contacts: Vec<ContactRecord>,
        ledger: &SendLedger,
        now: DateTime<Utc>,
    ) -> Vec<ContactRecord> {
        let cutoff = now - self.not_sent_within;
        let mut due: Vec<(Option<DateTime<Utc>>, ContactRecord)> = contacts
            .into_iter()
            .filter_map(|c| match ledger.get(&c.phone) {
                None => Some((None, c)),
                Some(r) if r.last_sent_at < cutoff => Some((Some(r.last_sent_at), c)),
                Some(_) => None,
            })
            .collect();

        // None sorts before Some, and the sort is stable for ties.
        due.sort_by_key(|(last, _)| *last);
        due.truncate(self.limit);
        due.into_iter().map(|(_, c)| c).collect()
    }
}
