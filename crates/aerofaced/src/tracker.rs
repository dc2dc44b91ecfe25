use aeroface_core::attendance::{
    on_identified, AttendancePolicy, AttendanceSession, SessionKey, SessionState, Transition,
};
use aeroface_store::{FaceStore, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::keyed::KeyedLocks;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceEvent {
    CheckedIn,
    CheckedOut,
}

/// Outcome of applying one positive identification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceUpdate {
    /// State after the identification.
    pub state: SessionState,
    /// Set when this identification changed the state.
    pub event: Option<AttendanceEvent>,
    /// Latest session for the key, if any.
    pub session: Option<AttendanceSession>,
}

/// Applies identifications to persisted attendance sessions.
///
/// The read-decide-write sequence for a key runs under that key's lock,
/// so concurrent identifications of the same person at the same venue
/// produce exactly one transition.
pub struct AttendanceTracker {
    store: Arc<FaceStore>,
    policy: AttendancePolicy,
    locks: KeyedLocks<SessionKey>,
}

impl AttendanceTracker {
    pub fn new(store: Arc<FaceStore>, policy: AttendancePolicy) -> Self {
        Self {
            store,
            policy,
            locks: KeyedLocks::evicting(),
        }
    }

    pub fn policy(&self) -> &AttendancePolicy {
        &self.policy
    }

    pub async fn record_identification(
        &self,
        key: &SessionKey,
        now: DateTime<Utc>,
    ) -> Result<AttendanceUpdate, StoreError> {
        let _guard = self.locks.lock(key).await;

        let latest = self.store.latest_session(key).await?;
        let transition = on_identified(key, latest.as_ref(), now, &self.policy);

        let (session, event) = match transition {
            Transition::Hold(state) => {
                return Ok(AttendanceUpdate {
                    state,
                    event: None,
                    session: latest,
                })
            }
            Transition::CheckIn(s) => (s, AttendanceEvent::CheckedIn),
            Transition::CheckOut(s) => (s, AttendanceEvent::CheckedOut),
        };

        let written = match event {
            AttendanceEvent::CheckedIn => self.store.insert_session(&session).await,
            AttendanceEvent::CheckedOut => self.store.close_session(&session).await,
        };

        match written {
            Ok(()) => {}
            // Another writer on the same database got there first.
            Err(StoreError::SessionConflict { .. } | StoreError::SessionNotOpen { .. }) => {
                tracing::warn!(
                    identity = %key.identity_id,
                    venue = %key.venue,
                    "attendance transition lost a race"
                );
                let current = self.store.latest_session(key).await?;
                return Ok(AttendanceUpdate {
                    state: current
                        .as_ref()
                        .map_or(SessionState::NotCheckedIn, AttendanceSession::state),
                    event: None,
                    session: current,
                });
            }
            Err(e) => return Err(e),
        }

        match event {
            AttendanceEvent::CheckedIn => tracing::info!(
                identity = %session.identity_id,
                venue = %session.venue,
                visit = session.visit,
                "checked in"
            ),
            AttendanceEvent::CheckedOut => tracing::info!(
                identity = %session.identity_id,
                venue = %session.venue,
                visit = session.visit,
                dwell_secs = session
                    .checkout_time
                    .map(|out| (out - session.checkin_time).num_seconds())
                    .unwrap_or_default(),
                "checked out"
            ),
        }

        Ok(AttendanceUpdate {
            state: session.state(),
            event: Some(event),
            session: Some(session),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aeroface_core::{Embedding, IdentityKey, Venue};
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    async fn tracker_with_identity() -> (AttendanceTracker, SessionKey) {
        let store = Arc::new(FaceStore::open_in_memory(None).await.unwrap());
        let emb = Embedding::new(vec![1.0, 0.0], None).unwrap();
        let id = store
            .set_embedding(&IdentityKey::parse("ana@example.com").unwrap(), None, &emb)
            .await
            .unwrap();
        let key = SessionKey {
            identity_id: id,
            venue: Venue::new("lounge-a").unwrap(),
        };
        (AttendanceTracker::new(store, AttendancePolicy::default()), key)
    }

    #[tokio::test]
    async fn check_in_hold_then_check_out() {
        let (tracker, key) = tracker_with_identity().await;

        let first = tracker.record_identification(&key, t(0)).await.unwrap();
        assert_eq!(first.event, Some(AttendanceEvent::CheckedIn));
        assert_eq!(first.state, SessionState::CheckedIn);

        let held = tracker.record_identification(&key, t(5)).await.unwrap();
        assert_eq!(held.event, None);
        assert_eq!(held.state, SessionState::CheckedIn);

        let out = tracker.record_identification(&key, t(12)).await.unwrap();
        assert_eq!(out.event, Some(AttendanceEvent::CheckedOut));
        assert_eq!(out.session.unwrap().checkout_time, Some(t(12)));

        let after = tracker.record_identification(&key, t(60)).await.unwrap();
        assert_eq!(after.event, None);
        assert_eq!(after.state, SessionState::CheckedOut);
    }

    #[tokio::test]
    async fn concurrent_identifications_open_one_session() {
        let (tracker, key) = tracker_with_identity().await;
        let tracker = Arc::new(tracker);

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let tracker = tracker.clone();
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                tracker.record_identification(&key, t(0)).await.unwrap()
            }));
        }
        let mut check_ins = 0;
        for task in tasks {
            if task.await.unwrap().event == Some(AttendanceEvent::CheckedIn) {
                check_ins += 1;
            }
        }
        assert_eq!(check_ins, 1);
        assert_eq!(tracker.store.sessions(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn trackers_sharing_a_store_agree_on_one_check_in() {
        let (first, key) = tracker_with_identity().await;
        let second = AttendanceTracker::new(first.store.clone(), AttendancePolicy::default());

        let (a, b) = tokio::join!(
            first.record_identification(&key, t(0)),
            second.record_identification(&key, t(0)),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        let (winner, loser) = if a.event.is_some() { (a, b) } else { (b, a) };
        assert_eq!(winner.event, Some(AttendanceEvent::CheckedIn));
        assert_eq!(loser.event, None);
        assert_eq!(loser.state, SessionState::CheckedIn);
        assert_eq!(loser.session, winner.session);

        let stored = first.store.sessions(None).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].visit, 1);
    }
}
