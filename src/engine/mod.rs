mod conflict;
mod error;
mod mutations;
mod queries;

pub use conflict::{can_book, slots_collide, BookingDecision};
pub use error::EngineError;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock, RwLockReadGuard};
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partially buffered bytes don't
    // leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// In-memory reservation store for one campus, backed by its WAL.
pub struct Engine {
    pub rooms: DashMap<Ulid, SharedRoomState>,
    pub(super) users: DashMap<Ulid, User>,
    /// Unique index: user name → user id.
    pub(super) usernames: DashMap<String, Ulid>,
    /// Reverse lookup: reservation id → room id.
    pub(super) reservation_to_room: DashMap<Ulid, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Held shared by every mutation and exclusively by compaction, so a
    /// compaction snapshot never misses an event that is still in flight.
    pub(super) write_gate: RwLock<()>,
    /// Serializes user and room creation so uniqueness checks and inserts
    /// cannot interleave.
    pub(super) directory_lock: Mutex<()>,
}

/// Apply an event to a room (no locking; caller holds the room's write lock).
fn apply_to_room(rs: &mut RoomState, event: &Event, reservation_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::RoomStatusChanged { status, .. } => rs.status = *status,
        Event::ReservationConfirmed(reservation) => {
            reservation_map.insert(reservation.id, reservation.room_id);
            rs.insert_reservation(reservation.clone());
        }
        Event::ReservationDeleted { id, .. } => {
            rs.remove_reservation(*id);
            reservation_map.remove(id);
        }
        // Users and room creation live at the map level, not here
        Event::UserCreated { .. } | Event::UserDeleted { .. } | Event::RoomCreated { .. } => {}
    }
}

/// The room an event mutates, for events applied through `apply_to_room`.
fn event_room_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::RoomStatusChanged { id, .. } => Some(*id),
        Event::ReservationConfirmed(r) => Some(r.room_id),
        Event::ReservationDeleted { room_id, .. } => Some(*room_id),
        Event::UserCreated { .. } | Event::UserDeleted { .. } | Event::RoomCreated { .. } => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rooms: DashMap::new(),
            users: DashMap::new(),
            usernames: DashMap::new(),
            reservation_to_room: DashMap::new(),
            wal_tx,
            write_gate: RwLock::new(()),
            directory_lock: Mutex::new(()),
        };

        // Rebuild rooms in plain maps first; nothing else can see them yet.
        let mut rooms: HashMap<Ulid, RoomState> = HashMap::new();
        for event in &events {
            match event {
                Event::UserCreated { .. } | Event::UserDeleted { .. } => engine.apply_user_event(event),
                Event::RoomCreated { id, name, capacity, category, status } => {
                    rooms.insert(*id, RoomState::new(*id, name.clone(), *capacity, *category, *status));
                }
                other => {
                    if let Some(rs) = event_room_id(other).and_then(|id| rooms.get_mut(&id)) {
                        apply_to_room(rs, other, &engine.reservation_to_room);
                    }
                }
            }
        }
        for (id, rs) in rooms {
            engine.rooms.insert(id, Arc::new(RwLock::new(rs)));
        }

        if !events.is_empty() {
            info!(
                "replayed {} events from {}: {} users, {} rooms, {} reservations",
                events.len(),
                wal_path.display(),
                engine.users.len(),
                engine.rooms.len(),
                engine.reservation_to_room.len()
            );
        }
        Ok(engine)
    }

    fn apply_user_event(&self, event: &Event) {
        match event {
            Event::UserCreated { id, username, role, email, created_at } => {
                self.usernames.insert(username.clone(), *id);
                self.users.insert(
                    *id,
                    User {
                        id: *id,
                        username: username.clone(),
                        role: *role,
                        email: email.clone(),
                        created_at: *created_at,
                    },
                );
            }
            Event::UserDeleted { id } => {
                if let Some((_, user)) = self.users.remove(id) {
                    self.usernames.remove(&user.username);
                }
            }
            _ => {}
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::StorageError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StorageError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StorageError(e.to_string()))
    }

    pub(super) async fn mutation_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.write_gate.read().await
    }

    pub fn get_room(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn get_room_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_room.get(reservation_id).map(|e| *e.value())
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// WAL-append then apply to the locked room.
    pub(super) async fn persist_and_apply(&self, rs: &mut RoomState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_room(rs, event, &self.reservation_to_room);
        Ok(())
    }

    /// WAL-append then apply a user event.
    pub(super) async fn persist_user_event(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_user_event(event);
        Ok(())
    }

    /// Lookup reservation → room, get room, acquire write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<RoomState>), EngineError> {
        let room_id = self
            .get_room_for_reservation(reservation_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.write_owned().await;
        Ok((room_id, guard))
    }
}
