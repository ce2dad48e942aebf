use std::sync::Arc;
use std::time::Duration;

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Rewrites a team's WAL whenever enough records have piled up since the
/// last compaction. Stops when the engine's last other owner is gone.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        if Arc::strong_count(&engine) == 1 {
            tracing::debug!(team = %engine.team_id, "engine dropped, compactor exiting");
            return;
        }
        if !should_compact(engine.wal_appends_since_compact().await, threshold) {
            continue;
        }
        if let Err(e) = engine.compact_wal().await {
            tracing::error!(team = %engine.team_id, "WAL compaction failed: {e}");
        }
    }
}

fn should_compact(appends: u64, threshold: u64) -> bool {
    threshold > 0 && appends >= threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthContext, Role};
    use crate::engine::NewSession;
    use crate::model::*;
    use chrono_tz::Tz;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotward_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[test]
    fn threshold_gate() {
        assert!(!should_compact(10, 0));
        assert!(!should_compact(9, 10));
        assert!(should_compact(10, 10));
    }

    #[tokio::test]
    async fn compaction_shrinks_and_preserves() {
        let path = test_wal_path("shrink.wal");
        let staff = AuthContext::new("desk", "gym", Role::Staff);
        let sid = Ulid::new();
        {
            let engine = Engine::new("gym", path.clone(), Tz::UTC, Duration::from_secs(5)).unwrap();
            let start = 1_750_000_000_000;
            engine
                .create_session(&staff, NewSession {
                    id: sid,
                    instructor_id: Ulid::new(),
                    branch_id: Ulid::new(),
                    span: Span::new(start, start + 3_600_000),
                    capacity: 5,
                    notes: None,
                })
                .await
                .unwrap();
            for cap in 6..40 {
                engine.set_capacity(&staff, sid, cap).await.unwrap();
            }
            let before = std::fs::metadata(&path).unwrap().len();
            assert!(engine.wal_appends_since_compact().await >= 35);

            engine.compact_wal().await.unwrap();
            assert_eq!(engine.wal_appends_since_compact().await, 0);
            assert!(std::fs::metadata(&path).unwrap().len() < before);
        }

        let engine = Engine::new("gym", path, Tz::UTC, Duration::from_secs(5)).unwrap();
        let s = engine.session_details(&staff, sid).await.unwrap();
        assert_eq!(s.capacity, 39);
    }
}
