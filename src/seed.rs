//! Demo accounts, rooms and bookings for a freshly created campus.

use std::collections::HashMap;

use tracing::info;
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::{BookingRequest, Role, RoomCategory, RoomStatus};

const SAMPLE_USERS: &[(&str, Role, &str)] = &[
    ("student1", Role::Student, "student1@campus.com"),
    ("faculty1", Role::Faculty, "faculty1@campus.com"),
    ("chef1", Role::Chef, "chef1@campus.com"),
    ("buscoord1", Role::BusCoordinator, "buscoord1@campus.com"),
];

const SAMPLE_ROOMS: &[(&str, u32, RoomCategory)] = &[
    ("Room 101", 30, RoomCategory::Classroom),
    ("Room 102", 25, RoomCategory::Classroom),
    ("Lab A", 20, RoomCategory::Laboratory),
    ("Library", 50, RoomCategory::Library),
    ("Conference Room", 15, RoomCategory::Conference),
];

/// Room, booker, date, start, end, purpose.
const SAMPLE_BOOKINGS: &[(&str, &str, &str, &str, &str, &str)] = &[
    ("Room 101", "admin", "2024-01-15", "09:00", "11:00", "Class meeting"),
    ("Room 102", "student1", "2024-01-16", "14:00", "16:00", "Study group"),
    ("Lab A", "faculty1", "2024-01-17", "10:00", "12:00", "Lab session"),
];

/// Ensure the bootstrap admin exists. Returns true if it was created.
pub async fn ensure_admin(engine: &Engine, username: &str) -> Result<bool, EngineError> {
    if engine.lookup_user(username).is_some() {
        return Ok(false);
    }
    engine
        .bootstrap_user(
            Ulid::new(),
            username.to_string(),
            Role::Admin,
            Some(format!("{username}@campus.com")),
        )
        .await?;
    info!("created bootstrap admin {username:?}");
    Ok(true)
}

/// Add the sample users, rooms and bookings. Users that already exist are
/// skipped. Bookings go through the regular booking path, so they are
/// checked like any other request; `admin_user` books the admin's sample.
pub async fn seed_sample_data(engine: &Engine, admin_user: &str) -> Result<(), EngineError> {
    for (username, role, email) in SAMPLE_USERS {
        if engine.lookup_user(username).is_none() {
            engine
                .bootstrap_user(Ulid::new(), username.to_string(), *role, Some(email.to_string()))
                .await?;
        }
    }

    let mut rooms = HashMap::new();
    for (name, capacity, category) in SAMPLE_ROOMS {
        let id = Ulid::new();
        engine
            .bootstrap_room(id, name.to_string(), *capacity, *category, RoomStatus::Available)
            .await?;
        rooms.insert(*name, id);
    }

    let mut booked = 0;
    for (room, user, date, start, end, purpose) in SAMPLE_BOOKINGS {
        let Some(&room_id) = rooms.get(room) else { continue };
        let user = if *user == "admin" { admin_user } else { *user };
        let ctx = engine.context_for(user)?;
        let request = BookingRequest::parse(Ulid::new(), room_id, date, start, end, Some(purpose.to_string()))?;
        engine.book_room(&ctx, request).await?;
        booked += 1;
    }

    info!(
        "seeded {} sample users, {} sample rooms and {booked} sample bookings",
        SAMPLE_USERS.len(),
        SAMPLE_ROOMS.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReservationFilter;

    fn test_wal_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("campusd_test_seed");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn sample_campus_has_bookings_and_admin_email() {
        let engine = Engine::new(test_wal_path("sample.wal")).unwrap();
        assert!(ensure_admin(&engine, "admin").await.unwrap());
        seed_sample_data(&engine, "admin").await.unwrap();

        let admin = engine.lookup_user("admin").unwrap();
        assert_eq!(admin.email.as_deref(), Some("admin@campus.com"));

        let ctx = engine.context_for("admin").unwrap();
        let bookings = engine
            .list_reservations(&ctx, ReservationFilter::default())
            .await
            .unwrap();
        let summary: Vec<_> = bookings
            .iter()
            .map(|b| (b.room_name.as_str(), b.username.as_deref(), b.reservation.purpose.as_deref()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("Lab A", Some("faculty1"), Some("Lab session")),
                ("Room 102", Some("student1"), Some("Study group")),
                ("Room 101", Some("admin"), Some("Class meeting")),
            ]
        );
    }

    #[tokio::test]
    async fn sample_bookings_block_their_slots() {
        let engine = Engine::new(test_wal_path("sample_conflict.wal")).unwrap();
        ensure_admin(&engine, "admin").await.unwrap();
        seed_sample_data(&engine, "admin").await.unwrap();

        let room = engine
            .list_rooms(&engine.context_for("admin").unwrap(), None)
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.name == "Room 101")
            .unwrap();
        let student = engine.context_for("student1").unwrap();
        let request = BookingRequest::parse(Ulid::new(), room.id, "2024-01-15", "10:00", "12:00", None).unwrap();
        assert!(engine.book_room(&student, request).await.unwrap_err().is_conflict());
    }
}
