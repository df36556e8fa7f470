use chrono::NaiveDate;
use ulid::Ulid;

use crate::access::{authorize, Action, RequestContext};
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub fn lookup_user(&self, username: &str) -> Option<User> {
        let id = *self.usernames.get(username)?.value();
        self.users.get(&id).map(|u| u.value().clone())
    }

    /// Resolve a login name into the context every request carries.
    pub fn context_for(&self, username: &str) -> Result<RequestContext, EngineError> {
        self.lookup_user(username)
            .map(|u| RequestContext::for_user(&u))
            .ok_or_else(|| EngineError::UnknownUser(username.to_string()))
    }

    pub fn list_users(&self, ctx: &RequestContext) -> Result<Vec<User>, EngineError> {
        authorize(ctx, Action::ListUsers)?;
        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }

    /// Rooms sorted by name. Non-admins only ever see available rooms.
    pub async fn list_rooms(
        &self,
        ctx: &RequestContext,
        status: Option<RoomStatus>,
    ) -> Result<Vec<RoomInfo>, EngineError> {
        let status = match status {
            Some(RoomStatus::Unavailable) => {
                authorize(ctx, Action::ListUnavailableRooms)?;
                Some(RoomStatus::Unavailable)
            }
            None if !ctx.is_admin() => Some(RoomStatus::Available),
            other => other,
        };

        let rooms: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(rooms.len());
        for rs in rooms {
            let guard = rs.read().await;
            if status.is_none_or(|s| s == guard.status) {
                out.push(guard.info());
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    pub async fn room_info(&self, id: Ulid) -> Result<RoomInfo, EngineError> {
        let rs = self.get_room(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        Ok(guard.info())
    }

    /// Active reservations of one room on one day, sorted by start time.
    pub async fn reservations_for(&self, room_id: Ulid, date: NaiveDate) -> Result<Vec<Reservation>, EngineError> {
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(guard.on(date).to_vec())
    }

    /// Reservations visible to `ctx`, newest day first and by start time
    /// within a day. Non-admins are restricted to their own bookings.
    pub async fn list_reservations(
        &self,
        ctx: &RequestContext,
        filter: ReservationFilter,
    ) -> Result<Vec<ReservationInfo>, EngineError> {
        let mut filter = filter;
        match filter.user_id {
            Some(uid) if uid != ctx.user_id => authorize(ctx, Action::ListAllReservations)?,
            None if !ctx.is_admin() => filter.user_id = Some(ctx.user_id),
            _ => {}
        }

        let rooms: Vec<_> = match filter.room_id {
            Some(id) => self.get_room(&id).into_iter().collect(),
            None => self.rooms.iter().map(|e| e.value().clone()).collect(),
        };

        let mut out = Vec::new();
        for rs in rooms {
            let guard = rs.read().await;
            let candidates: Box<dyn Iterator<Item = &Reservation>> = match filter.date {
                Some(date) => Box::new(guard.on(date).iter()),
                None => Box::new(guard.iter_reservations()),
            };
            for r in candidates.filter(|r| filter.matches(r)) {
                out.push(ReservationInfo {
                    reservation: r.clone(),
                    room_name: guard.name.clone(),
                    username: self.users.get(&r.user_id).map(|u| u.username.clone()),
                });
            }
        }

        out.sort_by(|a, b| {
            let (a, b) = (&a.reservation, &b.reservation);
            b.date
                .cmp(&a.date)
                .then(a.slot.start.cmp(&b.slot.start))
                .then(a.id.cmp(&b.id))
        });
        Ok(out)
    }
}
