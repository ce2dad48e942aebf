use tokio::sync::OwnedRwLockWriteGuard;
use ulid::Ulid;

use super::{Engine, EngineError, TxScope};
use crate::limits::MAX_CAPACITY;
use crate::model::{Event, SessionState};

/// Exclusive lock on one session row, held for the rest of a transaction.
pub type SessionGuard = OwnedRwLockWriteGuard<SessionState>;

impl Engine {
    /// The only way to lock a session for writing. The wait is bounded by
    /// the transaction deadline.
    pub async fn lock_session(&self, id: Ulid, tx: &TxScope) -> Result<SessionGuard, EngineError> {
        let row = self.session(&id).ok_or(EngineError::NotFound(id))?;
        let guard = tx.write("sessions", row).await?;
        // Deleted while we were queued on the lock.
        if !self.sessions.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        Ok(guard)
    }
}

impl SessionState {
    /// Claim one seat. Only valid on a locked row; the returned event must be
    /// committed in the same record as the booking that uses the seat.
    pub fn try_reserve(&self) -> Result<Event, EngineError> {
        if self.session.is_cancelled {
            return Err(EngineError::Cancelled);
        }
        if self.session.booked_count >= self.session.capacity {
            return Err(EngineError::Full);
        }
        Ok(Event::SeatsAdjusted {
            session_id: self.session.id,
            booked_count: self.session.booked_count + 1,
        })
    }

    /// Give one seat back. Never fails: a release at zero is clamped and
    /// reported as a ledger anomaly.
    pub fn release(&self) -> Event {
        let booked_count = match self.session.booked_count.checked_sub(1) {
            Some(n) => n,
            None => {
                tracing::warn!(
                    session = %self.session.id,
                    "seat release on a session with no booked seats, clamping at 0"
                );
                metrics::counter!(crate::observability::LEDGER_ANOMALIES_TOTAL).increment(1);
                0
            }
        };
        Event::SeatsAdjusted {
            session_id: self.session.id,
            booked_count,
        }
    }

    pub fn set_capacity(&self, capacity: u32) -> Result<Event, EngineError> {
        if capacity == 0 {
            return Err(EngineError::Invalid("capacity must be at least 1"));
        }
        if capacity > MAX_CAPACITY {
            return Err(EngineError::LimitExceeded("capacity too large"));
        }
        if capacity < self.session.booked_count {
            return Err(EngineError::CapacityBelowBooked {
                capacity,
                booked: self.session.booked_count,
            });
        }
        Ok(Event::CapacitySet {
            session_id: self.session.id,
            capacity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Session, Span};

    fn state(capacity: u32, booked: u32) -> SessionState {
        SessionState::new(Session {
            id: Ulid::new(),
            template_id: None,
            instructor_id: Ulid::new(),
            branch_id: Ulid::new(),
            span: Span::new(0, 3_600_000),
            capacity,
            booked_count: booked,
            is_cancelled: false,
            cancel_reason: None,
            notes: None,
        })
    }

    #[test]
    fn reserve_until_full() {
        let ss = state(2, 1);
        assert!(matches!(
            ss.try_reserve(),
            Ok(Event::SeatsAdjusted { booked_count: 2, .. })
        ));
        assert_eq!(state(2, 2).try_reserve(), Err(EngineError::Full));
    }

    #[test]
    fn cancelled_wins_over_full() {
        let mut ss = state(1, 1);
        ss.session.is_cancelled = true;
        assert_eq!(ss.try_reserve(), Err(EngineError::Cancelled));
    }

    #[test]
    fn release_clamps_at_zero() {
        assert!(matches!(
            state(3, 0).release(),
            Event::SeatsAdjusted { booked_count: 0, .. }
        ));
        assert!(matches!(
            state(3, 2).release(),
            Event::SeatsAdjusted { booked_count: 1, .. }
        ));
    }

    #[test]
    fn capacity_cannot_drop_below_bookings() {
        let ss = state(10, 4);
        assert_eq!(
            ss.set_capacity(3),
            Err(EngineError::CapacityBelowBooked { capacity: 3, booked: 4 })
        );
        assert!(ss.set_capacity(4).is_ok());
        assert!(matches!(ss.set_capacity(0), Err(EngineError::Invalid(_))));
    }
}
