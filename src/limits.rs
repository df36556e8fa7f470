//! Hard caps applied at the engine and campus boundaries.

pub const MAX_CAMPUSES: usize = 64;
pub const MAX_CAMPUS_NAME_LEN: usize = 64;

pub const MAX_USERS_PER_CAMPUS: usize = 100_000;
pub const MAX_ROOMS_PER_CAMPUS: usize = 10_000;
pub const MAX_RESERVATIONS_PER_ROOM: usize = 50_000;

pub const MAX_USERNAME_LEN: usize = 64;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_ROOM_NAME_LEN: usize = 128;
pub const MAX_PURPOSE_LEN: usize = 1024;
