//! Backfill continuation state machine.
//!
//! A backfill walks a fixed historical date range one calendar day at a time,
//! one page at a time, and persists its position after every page so any
//! invocation can be terminated and resumed at the exact cursor. Only the
//! transitions below are expressible; everything else is rejected at the
//! call site instead of being scattered through string comparisons.

use serde::{Deserialize, Serialize};
use time::Date;

use crate::error::{StateError, StateResult};

/// Number of error messages retained per backfill.
const MAX_ERRORS: usize = 20;

/// Lifecycle of a backfill job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillStatus {
    /// Created but no page fetched yet.
    NotStarted,
    /// Actively walking the range.
    InProgress,
    /// Every day in the range completed.
    Complete,
    /// The last page fetch failed; position is unchanged and will be
    /// retried by the next trigger.
    Error,
}

impl BackfillStatus {
    /// Stable lowercase name, as used in responses and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackfillStatus::NotStarted => "not_started",
            BackfillStatus::InProgress => "in_progress",
            BackfillStatus::Complete => "complete",
            BackfillStatus::Error => "error",
        }
    }
}

/// Durable continuation state for one site's backfill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillState {
    /// Site being backfilled.
    pub site: String,
    /// First day of the range, inclusive.
    pub range_start: Date,
    /// Last day of the range, inclusive.
    pub range_end: Date,
    /// Day currently being fetched.
    pub current_date: Date,
    /// Opaque pagination cursor within `current_date`. `None` means the next
    /// fetch starts the day from its first page.
    pub current_cursor: Option<String>,
    /// Days fully fetched, in completion order.
    pub completed_dates: Vec<Date>,
    /// Job status.
    pub status: BackfillStatus,
    /// Total samples fetched across all pages.
    pub samples_fetched: u64,
    /// Most recent fetch errors, oldest first.
    pub errors: Vec<String>,
}

impl BackfillState {
    /// Create a fresh backfill over `[range_start, range_end]`.
    pub fn new(site: impl Into<String>, range_start: Date, range_end: Date) -> StateResult<Self> {
        if range_start > range_end {
            return Err(StateError::InvalidRange {
                start: range_start.to_string(),
                end: range_end.to_string(),
            });
        }
        Ok(Self {
            site: site.into(),
            range_start,
            range_end,
            current_date: range_start,
            current_cursor: None,
            completed_dates: Vec::new(),
            status: BackfillStatus::NotStarted,
            samples_fetched: 0,
            errors: Vec::new(),
        })
    }

    /// Move into `InProgress`.
    ///
    /// Valid from `NotStarted` (first trigger), `InProgress` (continuation),
    /// and `Error` (retry of the failed page). A completed backfill can only
    /// be restarted through an explicit reset.
    pub fn begin(&mut self) -> StateResult<()> {
        match self.status {
            BackfillStatus::NotStarted | BackfillStatus::InProgress | BackfillStatus::Error => {
                self.status = BackfillStatus::InProgress;
                Ok(())
            }
            BackfillStatus::Complete => Err(StateError::InvalidTransition {
                from: "complete",
                to: "in_progress",
            }),
        }
    }

    /// Record one successfully fetched page.
    ///
    /// A non-empty `next_cursor` positions the next fetch within the same
    /// day. `None` is authoritative for "day complete": the day is appended
    /// to `completed_dates` and the position advances one calendar day, or
    /// the whole job transitions to `Complete` once past `range_end`.
    pub fn record_page(&mut self, fetched: u64, next_cursor: Option<String>) -> StateResult<()> {
        if self.status != BackfillStatus::InProgress {
            return Err(StateError::InvalidTransition {
                from: self.status.as_str(),
                to: "in_progress",
            });
        }
        self.samples_fetched += fetched;
        match next_cursor {
            Some(cursor) => self.current_cursor = Some(cursor),
            None => {
                self.completed_dates.push(self.current_date);
                self.current_cursor = None;
                match self.current_date.next_day() {
                    Some(next) if next <= self.range_end => self.current_date = next,
                    _ => self.status = BackfillStatus::Complete,
                }
            }
        }
        Ok(())
    }

    /// Record a failed page fetch.
    ///
    /// The position `(current_date, current_cursor)` is left untouched so the
    /// same page is retried on the next trigger.
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        if self.errors.len() > MAX_ERRORS {
            let excess = self.errors.len() - MAX_ERRORS;
            self.errors.drain(..excess);
        }
        if self.status == BackfillStatus::InProgress {
            self.status = BackfillStatus::Error;
        }
    }

    /// Whether another trigger is needed to make further progress.
    pub fn continuation(&self) -> bool {
        matches!(
            self.status,
            BackfillStatus::NotStarted | BackfillStatus::InProgress | BackfillStatus::Error
        )
    }

    /// Total days in the range.
    pub fn total_days(&self) -> u64 {
        ((self.range_end - self.range_start).whole_days() + 1) as u64
    }

    /// Completion percentage by whole days, 0.0 to 100.0.
    pub fn percent(&self) -> f64 {
        if self.status == BackfillStatus::Complete {
            return 100.0;
        }
        (self.completed_dates.len() as f64 / self.total_days() as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use time::macros::date;

    fn two_day_state() -> BackfillState {
        BackfillState::new("hq", date!(2024 - 12 - 10), date!(2024 - 12 - 11)).unwrap()
    }

    #[test]
    fn test_new_rejects_inverted_range() {
        let err = BackfillState::new("hq", date!(2024 - 12 - 11), date!(2024 - 12 - 10));
        assert!(matches!(err, Err(StateError::InvalidRange { .. })));
    }

    #[test]
    fn test_page_with_cursor_keeps_date() {
        let mut state = two_day_state();
        state.begin().unwrap();
        state.record_page(100, Some("c1".into())).unwrap();

        assert_eq!(state.current_date, date!(2024 - 12 - 10));
        assert_eq!(state.current_cursor.as_deref(), Some("c1"));
        assert!(state.completed_dates.is_empty());
        assert_eq!(state.samples_fetched, 100);
    }

    #[test]
    fn test_empty_cursor_advances_date() {
        let mut state = two_day_state();
        state.begin().unwrap();
        state.record_page(100, Some("c1".into())).unwrap();
        state.record_page(50, None).unwrap();

        assert_eq!(state.current_date, date!(2024 - 12 - 11));
        assert_eq!(state.current_cursor, None);
        assert_eq!(state.completed_dates, vec![date!(2024 - 12 - 10)]);
        assert_eq!(state.status, BackfillStatus::InProgress);
    }

    #[test]
    fn test_completes_past_range_end() {
        let mut state = two_day_state();
        state.begin().unwrap();
        state.record_page(10, None).unwrap();
        state.record_page(10, None).unwrap();

        assert_eq!(state.status, BackfillStatus::Complete);
        assert_eq!(
            state.completed_dates,
            vec![date!(2024 - 12 - 10), date!(2024 - 12 - 11)]
        );
        assert!(!state.continuation());
        assert!((state.percent() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_error_preserves_position_and_is_resumable() {
        let mut state = two_day_state();
        state.begin().unwrap();
        state.record_page(100, Some("c1".into())).unwrap();
        state.record_error("ACE API HTTP error (503)");

        assert_eq!(state.status, BackfillStatus::Error);
        assert_eq!(state.current_date, date!(2024 - 12 - 10));
        assert_eq!(state.current_cursor.as_deref(), Some("c1"));
        assert!(state.continuation());

        // Next trigger retries the same page.
        state.begin().unwrap();
        assert_eq!(state.status, BackfillStatus::InProgress);
        assert_eq!(state.current_cursor.as_deref(), Some("c1"));
    }

    #[test]
    fn test_complete_rejects_begin() {
        let mut state =
            BackfillState::new("hq", date!(2024 - 12 - 10), date!(2024 - 12 - 10)).unwrap();
        state.begin().unwrap();
        state.record_page(1, None).unwrap();
        assert_eq!(state.status, BackfillStatus::Complete);

        assert!(matches!(
            state.begin(),
            Err(StateError::InvalidTransition { from: "complete", .. })
        ));
    }

    #[test]
    fn test_record_page_requires_in_progress() {
        let mut state = two_day_state();
        assert!(state.record_page(1, None).is_err());
    }

    #[test]
    fn test_errors_are_capped() {
        let mut state = two_day_state();
        state.begin().unwrap();
        for i in 0..50 {
            state.record_error(format!("error {i}"));
        }
        assert_eq!(state.errors.len(), MAX_ERRORS);
        assert_eq!(state.errors.last().unwrap(), "error 49");
    }

    #[test]
    fn test_state_round_trips_through_json() {
        let mut state = two_day_state();
        state.begin().unwrap();
        state.record_page(42, Some("cursor-a".into())).unwrap();

        let json = serde_json::to_string(&state).unwrap();
        let back: BackfillState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    proptest! {
        /// Days only ever complete when a page reports no further cursor, and
        /// the current date never moves backwards.
        #[test]
        fn prop_date_advances_only_on_empty_cursor(pages in proptest::collection::vec(any::<bool>(), 1..64)) {
            let mut state = BackfillState::new(
                "hq",
                date!(2024 - 01 - 01),
                date!(2024 - 12 - 31),
            ).unwrap();
            state.begin().unwrap();

            let mut prev_date = state.current_date;
            let mut prev_completed = 0usize;
            for has_more in pages {
                if state.status == BackfillStatus::Complete {
                    break;
                }
                let cursor = has_more.then(|| "next".to_string());
                state.record_page(1, cursor).unwrap();

                prop_assert!(state.current_date >= prev_date);
                if has_more {
                    prop_assert_eq!(state.completed_dates.len(), prev_completed);
                } else {
                    prop_assert_eq!(state.completed_dates.len(), prev_completed + 1);
                }
                prev_date = state.current_date;
                prev_completed = state.completed_dates.len();
            }
        }
    }
}
