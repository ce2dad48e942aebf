use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use dashmap::DashMap;

use crate::compactor;
use crate::config::Config;
use crate::engine::Engine;
use crate::limits::*;

/// One engine per team, created on first use. Team = database name of the
/// pgwire connection; each team gets its own WAL file and compactor task.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    default_zone: Tz,
    lock_timeout: Duration,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, default_zone: Tz, lock_timeout: Duration) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            default_zone,
            lock_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.data_dir.clone(),
            config.compact_threshold,
            config.default_zone,
            config.lock_timeout,
        )
    }

    pub fn get_or_create(&self, team: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(team) {
            return Ok(engine.value().clone());
        }
        if team.len() > MAX_TEAM_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "team name too long",
            ));
        }
        if self.engines.len() >= MAX_TEAMS {
            return Err(std::io::Error::other("too many teams"));
        }

        if team.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty team name",
            ));
        }

        // Two callers may race to here; the entry API keeps exactly one engine.
        let engine = match self.engines.entry(team.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(e) => return Ok(e.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(wal_file_name(team));
                let engine = Arc::new(Engine::new(
                    team,
                    wal_path,
                    self.default_zone,
                    self.lock_timeout,
                )?);
                slot.insert(engine.clone());
                engine
            }
        };

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        metrics::gauge!(crate::observability::TEAMS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!(team, "team engine loaded");
        Ok(engine)
    }
}

/// WAL file for a team. Plain names map to `<team>.wal`; anything else is
/// hex encoded as `<hex>.hex.wal`. Plain names never contain a dot, so the
/// two forms cannot collide and no two teams share a file.
pub fn wal_file_name(team: &str) -> String {
    if team
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return format!("{team}.wal");
    }
    let mut encoded = String::with_capacity(team.len() * 2 + 8);
    for b in team.bytes() {
        encoded.push_str(&format!("{b:02x}"));
    }
    encoded.push_str(".hex.wal");
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthContext, Role};
    use crate::engine::{NewBooking, NewSession};
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotward_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, 1000, Tz::UTC, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn teams_are_isolated() {
        let tm = manager(test_data_dir("isolation"));
        let gym_a = tm.get_or_create("gym_a").unwrap();
        let gym_b = tm.get_or_create("gym_b").unwrap();

        let sid = Ulid::new();
        let start = 1_750_000_000_000;
        for (engine, team) in [(&gym_a, "gym_a"), (&gym_b, "gym_b")] {
            let staff = AuthContext::new("desk", team, Role::Staff);
            engine
                .create_session(&staff, NewSession {
                    id: sid,
                    instructor_id: Ulid::new(),
                    branch_id: Ulid::new(),
                    span: Span::new(start, start + 3_600_000),
                    capacity: 1,
                    notes: None,
                })
                .await
                .unwrap();
        }

        let guest = AuthContext::new("guest", "gym_a", Role::Guest);
        gym_a
            .create_booking(&guest, NewBooking {
                session_id: sid,
                holder: Holder {
                    name: "Ann".into(),
                    email: "ann@example.com".into(),
                    phone: None,
                    user_id: None,
                },
                notes: None,
            })
            .await
            .unwrap();

        let staff_b = AuthContext::new("desk", "gym_b", Role::Staff);
        let b = gym_b.session_details(&staff_b, sid).await.unwrap();
        assert_eq!(b.booked_count, 0);
    }

    #[tokio::test]
    async fn wal_created_lazily() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
        let _eng = tm.get_or_create("my_gym").unwrap();
        assert!(dir.join("my_gym.wal").exists());
    }

    #[tokio::test]
    async fn same_engine_returned() {
        let tm = manager(test_data_dir("same_eng"));
        let a = tm.get_or_create("foo").unwrap();
        let b = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn team_name_never_escapes_data_dir() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());
        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("2e2e2f6576696c.hex.wal").exists());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 1);
        assert!(tm.get_or_create("").is_err());
    }

    #[test]
    fn wal_names_are_distinct() {
        assert_eq!(wal_file_name("my_gym"), "my_gym.wal");
        assert_ne!(wal_file_name("clinic.sg"), wal_file_name("clinicsg"));
        assert_ne!(wal_file_name("a/b"), wal_file_name("ab"));
        // A plain name that looks like hex still cannot hit the encoded form.
        assert_ne!(wal_file_name("2e"), wal_file_name("."));
    }

    #[tokio::test]
    async fn similar_team_names_stay_isolated() {
        let dir = test_data_dir("similar_names");
        let sid = Ulid::new();
        let start = 1_750_000_000_000;
        {
            let tm = manager(dir.clone());
            let dotted = tm.get_or_create("clinic.sg").unwrap();
            let staff = AuthContext::new("desk", "clinic.sg", Role::Staff);
            dotted
                .create_session(&staff, NewSession {
                    id: sid,
                    instructor_id: Ulid::new(),
                    branch_id: Ulid::new(),
                    span: Span::new(start, start + 3_600_000),
                    capacity: 4,
                    notes: None,
                })
                .await
                .unwrap();

            let plain = tm.get_or_create("clinicsg").unwrap();
            let staff = AuthContext::new("desk", "clinicsg", Role::Staff);
            assert!(plain.session_details(&staff, sid).await.is_err());
        }

        // After a restart each team still replays only its own log.
        let tm = manager(dir.clone());
        let plain = tm.get_or_create("clinicsg").unwrap();
        let staff = AuthContext::new("desk", "clinicsg", Role::Staff);
        assert!(plain.session_details(&staff, sid).await.is_err());

        let dotted = tm.get_or_create("clinic.sg").unwrap();
        let staff = AuthContext::new("desk", "clinic.sg", Role::Staff);
        assert_eq!(dotted.session_details(&staff, sid).await.unwrap().capacity, 4);
    }

    #[tokio::test]
    async fn team_name_too_long() {
        let tm = manager(test_data_dir("name_too_long"));
        let err = tm
            .get_or_create(&"x".repeat(MAX_TEAM_NAME_LEN + 1))
            .err()
            .unwrap();
        assert!(err.to_string().contains("team name too long"));
    }
}
