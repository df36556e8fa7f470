//! Request-scoped identity and role checks.
//!
//! Every engine operation that acts on behalf of a user receives a
//! [`RequestContext`] built from the connection's login name; nothing is read
//! from ambient session state.

use std::fmt;

use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::{Role, User};

/// Who is making the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: Ulid,
    pub username: String,
    pub role: Role,
}

impl RequestContext {
    pub fn for_user(user: &User) -> Self {
        Self {
            user_id: user.id,
            username: user.username.clone(),
            role: user.role,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    CreateUser,
    DeleteUser,
    ListUsers,
    CreateRoom,
    ChangeRoomStatus,
    ListUnavailableRooms,
    BookRoom,
    DeleteReservation,
    ListAllReservations,
}

impl Action {
    /// Booking is open to every signed-in role; everything else that touches
    /// other people's data is admin-only.
    pub fn permits(self, role: Role) -> bool {
        match self {
            Action::BookRoom => true,
            Action::CreateUser
            | Action::DeleteUser
            | Action::ListUsers
            | Action::CreateRoom
            | Action::ChangeRoomStatus
            | Action::ListUnavailableRooms
            | Action::DeleteReservation
            | Action::ListAllReservations => role == Role::Admin,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::CreateUser => "create users",
            Action::DeleteUser => "delete users",
            Action::ListUsers => "list users",
            Action::CreateRoom => "create rooms",
            Action::ChangeRoomStatus => "change room status",
            Action::ListUnavailableRooms => "list unavailable rooms",
            Action::BookRoom => "book rooms",
            Action::DeleteReservation => "delete reservations",
            Action::ListAllReservations => "list all reservations",
        };
        f.write_str(s)
    }
}

pub fn authorize(ctx: &RequestContext, action: Action) -> Result<(), EngineError> {
    if action.permits(ctx.role) {
        Ok(())
    } else {
        tracing::warn!(user = %ctx.username, role = %ctx.role, %action, "permission denied");
        Err(EngineError::PermissionDenied {
            role: ctx.role,
            action,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(role: Role) -> RequestContext {
        RequestContext {
            user_id: Ulid::new(),
            username: role.as_str().into(),
            role,
        }
    }

    #[test]
    fn every_role_may_book() {
        for role in [Role::Admin, Role::Student, Role::Faculty, Role::Chef, Role::BusCoordinator] {
            assert!(authorize(&ctx(role), Action::BookRoom).is_ok());
        }
    }

    #[test]
    fn only_admin_deletes_reservations() {
        assert!(authorize(&ctx(Role::Admin), Action::DeleteReservation).is_ok());
        let err = authorize(&ctx(Role::Faculty), Action::DeleteReservation).unwrap_err();
        assert!(matches!(
            err,
            EngineError::PermissionDenied {
                role: Role::Faculty,
                action: Action::DeleteReservation
            }
        ));
        assert_eq!(err.to_string(), "permission denied: faculty may not delete reservations");
    }

    #[test]
    fn non_admins_cannot_touch_rooms_or_users() {
        for role in [Role::Student, Role::Faculty, Role::Chef, Role::BusCoordinator] {
            for action in [
                Action::CreateUser,
                Action::DeleteUser,
                Action::ListUsers,
                Action::CreateRoom,
                Action::ChangeRoomStatus,
                Action::ListUnavailableRooms,
                Action::ListAllReservations,
            ] {
                assert!(!action.permits(role), "{role} should not {action}");
            }
        }
    }
}
