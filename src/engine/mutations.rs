use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::access::{authorize, Action, RequestContext};
use crate::limits::*;
use crate::model::*;
use crate::observability::{BOOKINGS_TOTAL, OUTCOME_CONFLICT, OUTCOME_CONFIRMED, OUTCOME_REJECTED};

use super::conflict::{check_no_conflict, now_ms, validate_purpose};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Create a user without an acting admin. Used to bootstrap and seed a
    /// fresh campus.
    pub async fn bootstrap_user(
        &self,
        id: Ulid,
        username: String,
        role: Role,
        email: Option<String>,
    ) -> Result<(), EngineError> {
        let _gate = self.mutation_guard().await;
        self.insert_user(id, username, role, email).await
    }

    pub async fn create_user(
        &self,
        ctx: &RequestContext,
        id: Ulid,
        username: String,
        role: Role,
        email: Option<String>,
    ) -> Result<(), EngineError> {
        authorize(ctx, Action::CreateUser)?;
        let _gate = self.mutation_guard().await;
        self.insert_user(id, username, role, email).await?;
        info!(admin = %ctx.username, "created user {id} ({role})");
        Ok(())
    }

    async fn insert_user(
        &self,
        id: Ulid,
        username: String,
        role: Role,
        email: Option<String>,
    ) -> Result<(), EngineError> {
        let username = username.trim().to_string();
        if username.is_empty() {
            return Err(InvalidValue::new("user name", username).into());
        }
        if username.len() > MAX_USERNAME_LEN {
            return Err(EngineError::LimitExceeded("user name too long"));
        }
        if email.as_ref().is_some_and(|e| e.len() > MAX_EMAIL_LEN) {
            return Err(EngineError::LimitExceeded("email too long"));
        }

        let _directory = self.directory_lock.lock().await;
        if self.users.len() >= MAX_USERS_PER_CAMPUS {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if self.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.usernames.contains_key(&username) {
            return Err(EngineError::UsernameTaken(username));
        }

        let event = Event::UserCreated {
            id,
            username,
            role,
            email,
            created_at: now_ms(),
        };
        self.persist_user_event(&event).await
    }

    /// Hard delete. Reservations the user made stay on the books.
    pub async fn delete_user(&self, ctx: &RequestContext, id: Ulid) -> Result<(), EngineError> {
        authorize(ctx, Action::DeleteUser)?;
        let _gate = self.mutation_guard().await;
        let _directory = self.directory_lock.lock().await;
        if !self.users.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.persist_user_event(&Event::UserDeleted { id }).await?;
        info!(admin = %ctx.username, "deleted user {id}");
        Ok(())
    }

    /// Create a room without an acting admin. Used to seed a fresh campus.
    pub async fn bootstrap_room(
        &self,
        id: Ulid,
        name: String,
        capacity: u32,
        category: RoomCategory,
        status: RoomStatus,
    ) -> Result<(), EngineError> {
        let _gate = self.mutation_guard().await;
        self.insert_room(id, name, capacity, category, status).await
    }

    pub async fn create_room(
        &self,
        ctx: &RequestContext,
        id: Ulid,
        name: String,
        capacity: u32,
        category: RoomCategory,
        status: RoomStatus,
    ) -> Result<(), EngineError> {
        authorize(ctx, Action::CreateRoom)?;
        let _gate = self.mutation_guard().await;
        self.insert_room(id, name, capacity, category, status).await?;
        info!(admin = %ctx.username, "created room {id}");
        Ok(())
    }

    async fn insert_room(
        &self,
        id: Ulid,
        name: String,
        capacity: u32,
        category: RoomCategory,
        status: RoomStatus,
    ) -> Result<(), EngineError> {
        if name.trim().is_empty() {
            return Err(InvalidValue::new("room name", name).into());
        }
        if name.len() > MAX_ROOM_NAME_LEN {
            return Err(EngineError::LimitExceeded("room name too long"));
        }

        let _directory = self.directory_lock.lock().await;
        if self.rooms.len() >= MAX_ROOMS_PER_CAMPUS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if self.rooms.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::RoomCreated {
            id,
            name: name.clone(),
            capacity,
            category,
            status,
        };
        self.wal_append(&event).await?;
        let rs = RoomState::new(id, name, capacity, category, status);
        self.rooms.insert(id, Arc::new(RwLock::new(rs)));
        Ok(())
    }

    pub async fn set_room_status(
        &self,
        ctx: &RequestContext,
        id: Ulid,
        status: RoomStatus,
    ) -> Result<(), EngineError> {
        authorize(ctx, Action::ChangeRoomStatus)?;
        let _gate = self.mutation_guard().await;
        let rs = self.get_room(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;
        if guard.status == status {
            return Ok(());
        }
        let event = Event::RoomStatusChanged { id, status };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(admin = %ctx.username, "room {id} is now {status}");
        Ok(())
    }

    /// Book a room for the requesting user.
    ///
    /// The conflict check and the insert run under the room's write lock, so
    /// two requests for the same room and day are decided one after the
    /// other against the reservations the first one left behind.
    pub async fn book_room(
        &self,
        ctx: &RequestContext,
        request: BookingRequest,
    ) -> Result<Reservation, EngineError> {
        let result = self.try_book_room(ctx, request).await;
        let outcome = match &result {
            Ok(_) => OUTCOME_CONFIRMED,
            Err(e) if e.is_conflict() => OUTCOME_CONFLICT,
            Err(_) => OUTCOME_REJECTED,
        };
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn try_book_room(
        &self,
        ctx: &RequestContext,
        request: BookingRequest,
    ) -> Result<Reservation, EngineError> {
        authorize(ctx, Action::BookRoom)?;
        validate_purpose(request.purpose.as_deref())?;

        let _gate = self.mutation_guard().await;
        let rs = self
            .get_room(&request.room_id)
            .ok_or(EngineError::NotFound(request.room_id))?;
        let mut guard = rs.write().await;
        if guard.status != RoomStatus::Available {
            return Err(EngineError::RoomUnavailable(request.room_id));
        }
        if guard.reservation_count() >= MAX_RESERVATIONS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many reservations on room"));
        }
        if self.reservation_to_room.contains_key(&request.id) {
            return Err(EngineError::AlreadyExists(request.id));
        }

        if let Err(e) = check_no_conflict(&guard, request.date, &request.slot) {
            info!(
                user = %ctx.username,
                "booking of {} on {} {} rejected: {e}",
                guard.name, request.date, request.slot
            );
            return Err(e);
        }
        if request.slot.is_degenerate() {
            warn!(
                user = %ctx.username,
                "accepting degenerate slot {} for {} on {}",
                request.slot, guard.name, request.date
            );
        }

        let reservation = Reservation {
            id: request.id,
            room_id: request.room_id,
            user_id: ctx.user_id,
            date: request.date,
            slot: request.slot,
            purpose: request.purpose,
            status: ReservationStatus::Confirmed,
            created_at: now_ms(),
        };
        let event = Event::ReservationConfirmed(reservation.clone());
        self.persist_and_apply(&mut guard, &event).await?;
        info!(
            user = %ctx.username,
            "booked {} on {} {} ({})",
            guard.name, reservation.date, reservation.slot, reservation.id
        );
        Ok(reservation)
    }

    /// Hard delete of a reservation, freeing its slot. Returns the room id.
    pub async fn delete_reservation(&self, ctx: &RequestContext, id: Ulid) -> Result<Ulid, EngineError> {
        authorize(ctx, Action::DeleteReservation)?;
        let _gate = self.mutation_guard().await;
        let (room_id, mut guard) = self.resolve_reservation_write(&id).await?;
        // May have been deleted while we waited for the lock.
        if !guard.iter_reservations().any(|r| r.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::ReservationDeleted { id, room_id };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(admin = %ctx.username, "deleted reservation {id} in room {room_id}");
        Ok(room_id)
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.write_gate.write().await;

        let mut events = Vec::new();
        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        events.extend(users.into_iter().map(|u| Event::UserCreated {
            id: u.id,
            username: u.username,
            role: u.role,
            email: u.email,
            created_at: u.created_at,
        }));

        let rooms: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        for rs in rooms {
            let guard = rs.read().await;
            events.push(Event::RoomCreated {
                id: guard.id,
                name: guard.name.clone(),
                capacity: guard.capacity,
                category: guard.category,
                status: guard.status,
            });
            events.extend(
                guard
                    .iter_reservations()
                    .map(|r| Event::ReservationConfirmed(r.clone())),
            );
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::StorageError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StorageError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StorageError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
