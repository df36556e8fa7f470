use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for creation timestamps.
pub type Ms = i64;

/// A value that could not be parsed into one of the model types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {field}: {value:?}")]
pub struct InvalidValue {
    pub field: &'static str,
    pub value: String,
}

impl InvalidValue {
    pub fn new(field: &'static str, value: impl Into<String>) -> Self {
        Self {
            field,
            value: value.into(),
        }
    }
}

/// Parse a calendar day in `YYYY-MM-DD` form.
pub fn parse_date(s: &str) -> Result<NaiveDate, InvalidValue> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| InvalidValue::new("date", s))
}

/// Parse a wall-clock time, `HH:MM` or `HH:MM:SS`.
pub fn parse_time(s: &str) -> Result<NaiveTime, InvalidValue> {
    let t = s.trim();
    NaiveTime::parse_from_str(t, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(t, "%H:%M:%S"))
        .map_err(|_| InvalidValue::new("time", s))
}

/// Wall-clock interval `[start, end)` on a single day.
///
/// `start < end` is not enforced. Booking input is taken as given and only
/// the overlap rule decides whether it is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeSlot {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn parse(start: &str, end: &str) -> Result<Self, InvalidValue> {
        Ok(Self::new(parse_time(start)?, parse_time(end)?))
    }

    /// True for zero-length and inverted slots.
    pub fn is_degenerate(&self) -> bool {
        self.start >= self.end
    }
}

impl fmt::Display for TimeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

// ── Enumerations ─────────────────────────────────────────────────

macro_rules! text_enum {
    ($name:ident, $field:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = InvalidValue;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(InvalidValue::new($field, s)),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Student,
    Faculty,
    Chef,
    BusCoordinator,
}

text_enum!(Role, "role", {
    Admin => "admin",
    Student => "student",
    Faculty => "faculty",
    Chef => "chef",
    BusCoordinator => "buscoordinator",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomCategory {
    Classroom,
    Laboratory,
    Library,
    Conference,
}

text_enum!(RoomCategory, "room type", {
    Classroom => "classroom",
    Laboratory => "laboratory",
    Library => "library",
    Conference => "conference",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RoomStatus {
    #[default]
    Available,
    Unavailable,
}

text_enum!(RoomStatus, "room status", {
    Available => "available",
    Unavailable => "unavailable",
});

/// Only `Confirmed` is ever written; deletion is a hard delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReservationStatus {
    #[default]
    Confirmed,
    Cancelled,
}

text_enum!(ReservationStatus, "reservation status", {
    Confirmed => "confirmed",
    Cancelled => "cancelled",
});

// ── Entities ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub username: String,
    pub role: Role,
    pub email: Option<String>,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub room_id: Ulid,
    pub user_id: Ulid,
    pub date: NaiveDate,
    pub slot: TimeSlot,
    pub purpose: Option<String>,
    pub status: ReservationStatus,
    pub created_at: Ms,
}

#[derive(Debug, Clone)]
pub struct RoomState {
    pub id: Ulid,
    pub name: String,
    pub capacity: u32,
    pub category: RoomCategory,
    pub status: RoomStatus,
    /// Active reservations keyed by day, each day sorted by `slot.start`.
    pub reservations: BTreeMap<NaiveDate, Vec<Reservation>>,
}

impl RoomState {
    pub fn new(id: Ulid, name: String, capacity: u32, category: RoomCategory, status: RoomStatus) -> Self {
        Self {
            id,
            name,
            capacity,
            category,
            status,
            reservations: BTreeMap::new(),
        }
    }

    /// Insert a reservation keeping its day sorted by start time.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let day = self.reservations.entry(reservation.date).or_default();
        let pos = day.partition_point(|r| r.slot.start <= reservation.slot.start);
        day.insert(pos, reservation);
    }

    /// Remove a reservation by id, dropping the day bucket once it is empty.
    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let date = self
            .reservations
            .iter()
            .find(|(_, day)| day.iter().any(|r| r.id == id))
            .map(|(date, _)| *date)?;
        let day = self.reservations.get_mut(&date)?;
        let pos = day.iter().position(|r| r.id == id)?;
        let removed = day.remove(pos);
        if day.is_empty() {
            self.reservations.remove(&date);
        }
        Some(removed)
    }

    /// All active reservations held on `date`.
    pub fn on(&self, date: NaiveDate) -> &[Reservation] {
        self.reservations.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.values().map(Vec::len).sum()
    }

    pub fn iter_reservations(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.values().flatten()
    }

    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            id: self.id,
            name: self.name.clone(),
            capacity: self.capacity,
            category: self.category,
            status: self.status,
        }
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserCreated {
        id: Ulid,
        username: String,
        role: Role,
        email: Option<String>,
        created_at: Ms,
    },
    UserDeleted {
        id: Ulid,
    },
    RoomCreated {
        id: Ulid,
        name: String,
        capacity: u32,
        category: RoomCategory,
        status: RoomStatus,
    },
    RoomStatusChanged {
        id: Ulid,
        status: RoomStatus,
    },
    ReservationConfirmed(Reservation),
    ReservationDeleted {
        id: Ulid,
        room_id: Ulid,
    },
}

/// A parsed booking request, before it is checked against the room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub room_id: Ulid,
    pub date: NaiveDate,
    pub slot: TimeSlot,
    pub purpose: Option<String>,
}

impl BookingRequest {
    /// Build a request from the textual date and times a client sent.
    pub fn parse(
        id: Ulid,
        room_id: Ulid,
        date: &str,
        start: &str,
        end: &str,
        purpose: Option<String>,
    ) -> Result<Self, InvalidValue> {
        Ok(Self {
            id,
            room_id,
            date: parse_date(date)?,
            slot: TimeSlot::parse(start, end)?,
            purpose,
        })
    }
}

/// Optional equality filters for listing reservations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub room_id: Option<Ulid>,
    pub date: Option<NaiveDate>,
    pub user_id: Option<Ulid>,
}

impl ReservationFilter {
    pub fn matches(&self, r: &Reservation) -> bool {
        self.room_id.is_none_or(|id| id == r.room_id)
            && self.date.is_none_or(|d| d == r.date)
            && self.user_id.is_none_or(|id| id == r.user_id)
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub id: Ulid,
    pub name: String,
    pub capacity: u32,
    pub category: RoomCategory,
    pub status: RoomStatus,
}

/// A reservation joined with its room name and requester name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationInfo {
    pub reservation: Reservation,
    pub room_name: String,
    pub username: Option<String>,
}
