use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Outcome of checking a proposed slot against a room's reservations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingDecision {
    Allowed,
    /// The proposed slot collides with this existing reservation.
    Conflict(Ulid),
}

/// The overlap rule: `existing` blocks `proposed` when it covers the proposed
/// start, or when it covers the proposed end inclusively.
///
/// `(s <= S && e > S) || (s < E && e >= E)`
///
/// This is not the symmetric `s < E && S < e` test. An existing slot strictly
/// inside the proposed one (`S < s`, `e < E`) satisfies neither clause, and a
/// zero-length proposal is caught only by the first clause.
pub fn slots_collide(existing: &TimeSlot, proposed: &TimeSlot) -> bool {
    let (s, e) = (existing.start, existing.end);
    let (start, end) = (proposed.start, proposed.end);
    (s <= start && e > start) || (s < end && e >= end)
}

/// Decide whether `slot` on `date` can be booked in `room_id`.
///
/// `existing` is expected to hold the active reservations of that room and
/// day; anything for a different room or date is ignored. Pure: nothing is
/// read or written besides the arguments.
pub fn can_book(
    room_id: Ulid,
    date: NaiveDate,
    slot: &TimeSlot,
    existing: &[Reservation],
) -> BookingDecision {
    existing
        .iter()
        .filter(|r| r.room_id == room_id && r.date == date)
        .find(|r| slots_collide(&r.slot, slot))
        .map_or(BookingDecision::Allowed, |r| BookingDecision::Conflict(r.id))
}

/// Run the checker against a locked room and turn a conflict into an error.
pub(crate) fn check_no_conflict(rs: &RoomState, date: NaiveDate, slot: &TimeSlot) -> Result<(), EngineError> {
    match can_book(rs.id, date, slot, rs.on(date)) {
        BookingDecision::Allowed => Ok(()),
        BookingDecision::Conflict(existing) => Err(EngineError::Conflict {
            existing,
            date,
            slot: *slot,
        }),
    }
}

pub(crate) fn validate_purpose(purpose: Option<&str>) -> Result<(), EngineError> {
    if purpose.is_some_and(|p| p.len() > MAX_PURPOSE_LEN) {
        return Err(EngineError::LimitExceeded("purpose too long"));
    }
    Ok(())
}
