//! Calendar arithmetic for listings.
//!
//! Availability is always re-derived from the current booking rows: a day is taken
//! when a `pending` or `approved` booking of the same listing covers it. Ranges are
//! half-open, `[start, end)`, so a stay may begin on the day another one ends.

use std::sync::Arc;

use chrono::{Local, NaiveDate};
use serde::Serialize;

use crate::{
    error::Error,
    plugins::{bookings::BookingStatus, listings::ListingID},
};

/// Bounds on the length of a stay, in nights.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StayPolicy {
    pub min_stay: u32,
    pub max_stay: u32,
}

impl Default for StayPolicy {
    fn default() -> Self {
        Self {
            min_stay: 1,
            max_stay: 30,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct DateRange {
    #[serde(rename = "startDate")]
    pub start: NaiveDate,
    #[serde(rename = "endDate")]
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, Error> {
        if end <= start {
            return Err(Error::InvalidDateRange(
                "end date must be after start date".into(),
            ));
        }
        Ok(Self { start, end })
    }

    pub fn nights(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start < other.end && self.end > other.start
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day < self.end
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let end = self.end;
        self.start.iter_days().take_while(move |day| *day < end)
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Anything that may hold days on a listing's calendar.
pub trait Occupancy {
    fn listing(&self) -> ListingID;
    fn dates(&self) -> DateRange;
    fn status(&self) -> BookingStatus;
}

/// Source of "today" for past-date checks.
#[derive(Clone)]
pub struct Clock(Arc<dyn Fn() -> NaiveDate + Send + Sync>);

impl Clock {
    pub fn system() -> Self {
        Clock(Arc::new(|| Local::now().date_naive()))
    }

    #[cfg(test)]
    pub fn fixed(day: NaiveDate) -> Self {
        Clock(Arc::new(move || day))
    }

    pub fn today(&self) -> NaiveDate {
        (self.0)()
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Clock").field(&self.today()).finish()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AvailabilityCalculator {
    policy: StayPolicy,
    today: NaiveDate,
}

impl AvailabilityCalculator {
    pub fn new(policy: StayPolicy, today: NaiveDate) -> Self {
        Self { policy, today }
    }

    /// Checks a candidate stay on its own, before any calendar is consulted.
    pub fn validate(&self, start: NaiveDate, end: NaiveDate) -> Result<DateRange, Error> {
        let range = DateRange::new(start, end)?;
        if range.start < self.today {
            return Err(Error::InvalidDateRange(
                "start date cannot be in the past".into(),
            ));
        }
        let nights = range.nights();
        if nights < i64::from(self.policy.min_stay) {
            return Err(Error::InvalidDateRange(format!(
                "stays must be at least {} night(s)",
                self.policy.min_stay
            )));
        }
        if nights > i64::from(self.policy.max_stay) {
            return Err(Error::InvalidDateRange(format!(
                "stays cannot exceed {} nights",
                self.policy.max_stay
            )));
        }
        Ok(range)
    }

    pub fn is_range_available<B: Occupancy>(
        &self,
        listing: ListingID,
        start: NaiveDate,
        end: NaiveDate,
        bookings: &[B],
    ) -> Result<bool, Error> {
        let range = self.validate(start, end)?;
        Ok(conflicts(listing, range, bookings).next().is_none())
    }

    /// Like [`Self::is_range_available`], but an occupied range is an error.
    pub fn ensure_available<B: Occupancy>(
        &self,
        listing: ListingID,
        start: NaiveDate,
        end: NaiveDate,
        bookings: &[B],
    ) -> Result<DateRange, Error> {
        let range = self.validate(start, end)?;
        if conflicts(listing, range, bookings).next().is_some() {
            return Err(Error::DateRangeUnavailable {
                start: range.start,
                end: range.end,
            });
        }
        Ok(range)
    }
}

/// Bookings of `listing` that hold at least one day of `range`.
pub fn conflicts<'a, B: Occupancy>(
    listing: ListingID,
    range: DateRange,
    bookings: &'a [B],
) -> impl Iterator<Item = &'a B> + use<'a, B> {
    bookings.iter().filter(move |booking| {
        booking.listing() == listing
            && booking.status().holds_calendar()
            && booking.dates().overlaps(&range)
    })
}

/// The days of `window` not held by any booking of `listing`.
pub fn free_days<B: Occupancy>(
    listing: ListingID,
    window: DateRange,
    bookings: &[B],
) -> Vec<NaiveDate> {
    let held: Vec<DateRange> = bookings
        .iter()
        .filter(|b| b.listing() == listing && b.status().holds_calendar())
        .map(|b| b.dates())
        .collect();
    window
        .days()
        .filter(|day| !held.iter().any(|range| range.contains(*day)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Held {
        listing: ListingID,
        dates: DateRange,
        status: BookingStatus,
    }

    impl Occupancy for Held {
        fn listing(&self) -> ListingID {
            self.listing
        }
        fn dates(&self) -> DateRange {
            self.dates
        }
        fn status(&self) -> BookingStatus {
            self.status
        }
    }

    fn day(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, m, d).unwrap()
    }

    fn held(listing: i64, start: NaiveDate, end: NaiveDate, status: BookingStatus) -> Held {
        Held {
            listing: ListingID::from(listing),
            dates: DateRange::new(start, end).unwrap(),
            status,
        }
    }

    fn calculator() -> AvailabilityCalculator {
        AvailabilityCalculator::new(StayPolicy::default(), day(5, 1))
    }

    #[test]
    fn adjacent_ranges_do_not_conflict() {
        let existing = [held(1, day(6, 1), day(6, 5), BookingStatus::Approved)];
        let calc = calculator();
        assert!(calc.is_range_available(ListingID::from(1), day(6, 5), day(6, 8), &existing).unwrap());
        assert!(calc.is_range_available(ListingID::from(1), day(5, 28), day(6, 1), &existing).unwrap());
    }

    #[test]
    fn overlapping_range_is_rejected() {
        let existing = [held(1, day(6, 1), day(6, 5), BookingStatus::Pending)];
        let err = calculator()
            .ensure_available(ListingID::from(1), day(6, 3), day(6, 7), &existing)
            .unwrap_err();
        assert!(matches!(err, Error::DateRangeUnavailable { .. }));
    }

    #[test]
    fn enclosing_range_is_rejected() {
        let existing = [held(1, day(6, 3), day(6, 4), BookingStatus::Approved)];
        assert!(!calculator()
            .is_range_available(ListingID::from(1), day(6, 1), day(6, 10), &existing)
            .unwrap());
    }

    #[test]
    fn released_bookings_and_other_listings_are_ignored() {
        let existing = [
            held(1, day(6, 1), day(6, 5), BookingStatus::Declined),
            held(1, day(6, 1), day(6, 5), BookingStatus::Cancelled),
            held(2, day(6, 1), day(6, 5), BookingStatus::Approved),
        ];
        assert!(calculator()
            .is_range_available(ListingID::from(1), day(6, 2), day(6, 4), &existing)
            .unwrap());
    }

    #[test]
    fn zero_night_and_inverted_ranges_are_invalid() {
        let calc = calculator();
        let none: [Held; 0] = [];
        for (start, end) in [(day(6, 1), day(6, 1)), (day(6, 5), day(6, 1))] {
            let err = calc.is_range_available(ListingID::from(1), start, end, &none).unwrap_err();
            assert!(matches!(err, Error::InvalidDateRange(_)));
        }
    }

    #[test]
    fn past_start_is_invalid_but_today_is_fine() {
        let calc = calculator();
        assert!(matches!(calc.validate(day(4, 30), day(5, 3)), Err(Error::InvalidDateRange(_))));
        assert!(calc.validate(day(5, 1), day(5, 3)).is_ok());
    }

    #[test]
    fn stay_length_is_bounded() {
        let calc = calculator();
        assert!(calc.validate(day(6, 1), day(7, 1)).is_ok());
        assert!(matches!(calc.validate(day(6, 1), day(7, 2)), Err(Error::InvalidDateRange(_))));

        let strict = AvailabilityCalculator::new(StayPolicy { min_stay: 3, max_stay: 7 }, day(5, 1));
        assert!(matches!(strict.validate(day(6, 1), day(6, 3)), Err(Error::InvalidDateRange(_))));
        assert!(strict.validate(day(6, 1), day(6, 4)).is_ok());
    }

    #[test]
    fn free_days_skip_held_nights_only() {
        let existing = [
            held(1, day(6, 2), day(6, 4), BookingStatus::Approved),
            held(1, day(6, 5), day(6, 6), BookingStatus::Declined),
        ];
        let window = DateRange::new(day(6, 1), day(6, 7)).unwrap();
        let free = free_days(ListingID::from(1), window, &existing);
        assert_eq!(free, vec![day(6, 1), day(6, 4), day(6, 5), day(6, 6)]);
    }
}
