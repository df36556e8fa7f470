use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::compactor;
use crate::config::Config;
use crate::engine::{Engine, EngineError};
use crate::limits::*;
use crate::seed;

#[derive(Debug, Error)]
pub enum CampusError {
    #[error("campus name too long")]
    NameTooLong,
    #[error("empty campus name")]
    EmptyName,
    #[error("too many campuses")]
    TooMany,
    #[error("campus storage: {0}")]
    Io(#[from] io::Error),
    #[error("campus bootstrap: {0}")]
    Bootstrap(#[from] EngineError),
}

/// Keep `[A-Za-z0-9_-]` so the name is safe as a file stem.
pub fn sanitize_campus_name(name: &str) -> Result<String, CampusError> {
    if name.len() > MAX_CAMPUS_NAME_LEN {
        return Err(CampusError::NameTooLong);
    }
    let safe: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe.is_empty() {
        return Err(CampusError::EmptyName);
    }
    Ok(safe)
}

/// Per-campus engines. Each campus gets its own Engine, WAL and compactor.
/// Campus = database name from the pgwire connection.
pub struct CampusManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    admin_user: String,
    seed_sample_data: bool,
    /// Serializes campus creation so a campus is opened exactly once.
    creating: Mutex<()>,
}

impl CampusManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        let defaults = Config::default();
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            admin_user: defaults.admin_user,
            seed_sample_data: defaults.seed_sample_data,
            creating: Mutex::new(()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.data_dir.clone(), config.compact_threshold)
            .with_admin_user(config.admin_user.clone())
            .with_sample_data(config.seed_sample_data)
    }

    pub fn with_admin_user(mut self, admin_user: String) -> Self {
        self.admin_user = admin_user;
        self
    }

    pub fn with_sample_data(mut self, enabled: bool) -> Self {
        self.seed_sample_data = enabled;
        self
    }

    pub fn admin_user(&self) -> &str {
        &self.admin_user
    }

    /// Get or lazily open the engine for `campus`.
    pub async fn get_or_create(&self, campus: &str) -> Result<Arc<Engine>, CampusError> {
        let name = sanitize_campus_name(campus)?;
        if let Some(engine) = self.engines.get(&name) {
            return Ok(engine.value().clone());
        }

        let _creating = self.creating.lock().await;
        if let Some(engine) = self.engines.get(&name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_CAMPUSES {
            return Err(CampusError::TooMany);
        }

        let wal_path = self.data_dir.join(format!("{name}.wal"));
        let engine = Arc::new(Engine::new(wal_path)?);
        // Sample data only ever goes into a campus that has never held
        // anything; a campus that lost all its users only gets its admin back.
        let brand_new = engine.user_count() == 0 && engine.rooms.is_empty();
        if engine.user_count() == 0 {
            seed::ensure_admin(&engine, &self.admin_user).await?;
        }
        if brand_new && self.seed_sample_data {
            seed::seed_sample_data(&engine, &self.admin_user).await?;
        }

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        self.engines.insert(name.clone(), engine.clone());
        metrics::gauge!(crate::observability::CAMPUSES_ACTIVE).set(self.engines.len() as f64);
        info!("opened campus {name}");
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::RequestContext;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("campusd_test_campus").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn admin(engine: &Engine) -> RequestContext {
        engine.context_for("admin").unwrap()
    }

    #[tokio::test]
    async fn campuses_are_isolated() {
        let cm = CampusManager::new(test_data_dir("isolation"), 1000);
        let north = cm.get_or_create("north").await.unwrap();
        let south = cm.get_or_create("south").await.unwrap();

        let room = Ulid::new();
        north
            .create_room(&admin(&north), room, "Room 101".into(), 30, RoomCategory::Classroom, RoomStatus::Available)
            .await
            .unwrap();

        assert!(north.get_room(&room).is_some());
        assert!(south.get_room(&room).is_none());
    }

    #[tokio::test]
    async fn campus_opened_lazily_with_admin() {
        let dir = test_data_dir("lazy");
        let cm = CampusManager::new(dir.clone(), 1000).with_admin_user("dean".into());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);

        let engine = cm.get_or_create("main").await.unwrap();
        assert!(dir.join("main.wal").exists());
        let dean = engine.lookup_user("dean").unwrap();
        assert_eq!(dean.role, Role::Admin);
        assert_eq!(engine.user_count(), 1);
    }

    #[tokio::test]
    async fn same_engine_returned() {
        let cm = CampusManager::new(test_data_dir("same_engine"), 1000);
        let a = cm.get_or_create("foo").await.unwrap();
        let b = cm.get_or_create("foo").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn reopening_does_not_duplicate_admin() {
        let dir = test_data_dir("reopen");
        {
            let cm = CampusManager::new(dir.clone(), 1000).with_sample_data(true);
            let engine = cm.get_or_create("main").await.unwrap();
            assert_eq!(engine.user_count(), 5);
            assert_eq!(engine.rooms.len(), 5);
        }
        let cm = CampusManager::new(dir, 1000).with_sample_data(true);
        let engine = cm.get_or_create("main").await.unwrap();
        assert_eq!(engine.user_count(), 5);
        assert_eq!(engine.rooms.len(), 5);
    }

    #[tokio::test]
    async fn emptied_campus_is_not_reseeded() {
        let dir = test_data_dir("emptied");
        {
            let cm = CampusManager::new(dir.clone(), 1000).with_sample_data(true);
            let engine = cm.get_or_create("main").await.unwrap();
            let admin = admin(&engine);
            let mut users = engine.list_users(&admin).unwrap();
            // Delete the admin last so it can still act.
            users.sort_by_key(|u| u.username == "admin");
            for user in users {
                engine.delete_user(&admin, user.id).await.unwrap();
            }
            assert_eq!(engine.user_count(), 0);
        }
        let cm = CampusManager::new(dir, 1000).with_sample_data(true);
        let engine = cm.get_or_create("main").await.unwrap();
        assert_eq!(engine.user_count(), 1);
        assert!(engine.lookup_user("admin").is_some());
        assert_eq!(engine.rooms.len(), 5);
    }

    #[tokio::test]
    async fn campus_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let cm = CampusManager::new(dir.clone(), 1000);

        let evil = cm.get_or_create("../evil").await.unwrap();
        assert!(dir.join("evil.wal").exists());
        let plain = cm.get_or_create("evil").await.unwrap();
        assert!(Arc::ptr_eq(&evil, &plain));

        assert!(matches!(cm.get_or_create("../..").await, Err(CampusError::EmptyName)));
    }

    #[tokio::test]
    async fn campus_name_too_long() {
        let cm = CampusManager::new(test_data_dir("too_long"), 1000);
        let name = "x".repeat(MAX_CAMPUS_NAME_LEN + 1);
        assert!(matches!(cm.get_or_create(&name).await, Err(CampusError::NameTooLong)));
    }

    #[tokio::test]
    async fn campus_count_limit() {
        let cm = CampusManager::new(test_data_dir("count_limit"), 1000);
        for i in 0..MAX_CAMPUSES {
            cm.get_or_create(&format!("c{i}")).await.unwrap();
        }
        assert!(matches!(cm.get_or_create("one_more").await, Err(CampusError::TooMany)));
    }
}
