//! Remembers account-link completions that failed so they can be retried.

use std::collections::BTreeMap;
use std::sync::Arc;

use mockable::Clock;
use tracing::warn;

use crate::schemas::{LinkFailureRecord, MemberId};

pub struct LinkFailureTracker {
    clock: Arc<dyn Clock>,
    records: BTreeMap<MemberId, LinkFailureRecord>,
}

impl LinkFailureTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            records: BTreeMap::new(),
        }
    }

    /// Upsert by member id; a repeat failure bumps `retry_count`.
    pub fn record_failure(
        &mut self,
        member_id: MemberId,
        account_id: &str,
        account_email: &str,
        reason: &str,
    ) -> &LinkFailureRecord {
        let now = self.clock.utc();
        let record = self
            .records
            .entry(member_id)
            .and_modify(|record| {
                record.retry_count += 1;
                record.account_id = account_id.to_owned();
                record.account_email = account_email.to_owned();
                record.reason = reason.to_owned();
                record.timestamp = now;
            })
            .or_insert_with(|| LinkFailureRecord {
                member_id,
                account_id: account_id.to_owned(),
                account_email: account_email.to_owned(),
                reason: reason.to_owned(),
                retry_count: 1,
                timestamp: now,
            });
        warn!(
            member_id = %member_id,
            retry_count = record.retry_count,
            reason,
            "account link completion failed"
        );
        record
    }

    pub fn mark_resolved(&mut self, member_id: MemberId) -> Option<LinkFailureRecord> {
        self.records.remove(&member_id)
    }

    pub fn pending_failures(&self) -> Vec<LinkFailureRecord> {
        self.records.values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear_all(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::test_support::{fixture_time, member_id, ManualClock};

    #[test]
    fn repeat_failures_increment_the_retry_count() {
        let clock = ManualClock::shared();
        let mut tracker = LinkFailureTracker::new(clock.clone());
        tracker.record_failure(member_id(1), "acct-1", "one@example.com", "timeout");
        clock.advance(Duration::minutes(5));
        let record = tracker
            .record_failure(member_id(1), "acct-1", "one@example.com", "api 503")
            .clone();

        assert_eq!(record.retry_count, 2);
        assert_eq!(record.reason, "api 503");
        assert_eq!(record.timestamp, fixture_time() + Duration::minutes(5));
        assert_eq!(tracker.pending_failures(), vec![record]);
    }

    #[test]
    fn resolved_records_are_removed() {
        let mut tracker = LinkFailureTracker::new(ManualClock::shared());
        tracker.record_failure(member_id(1), "acct-1", "one@example.com", "timeout");
        tracker.record_failure(member_id(2), "acct-2", "two@example.com", "timeout");

        let resolved = tracker.mark_resolved(member_id(1));
        assert_eq!(resolved.map(|r| r.retry_count), Some(1));
        assert_eq!(tracker.pending_failures().len(), 1);
        assert!(tracker.mark_resolved(member_id(1)).is_none());

        tracker.clear_all();
        assert!(tracker.is_empty());
    }
}
