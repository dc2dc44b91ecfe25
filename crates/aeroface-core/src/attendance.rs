//! Attendance session state machine.
//!
//! A session is keyed by (identity, venue). The first accepted
//! identification checks the identity in; a later identification checks it
//! out, but only once the dwell time has elapsed. Elapsed time alone never
//! checks anyone out.

use crate::types::Venue;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Default minimum dwell before a checkout becomes eligible.
pub const DEFAULT_DWELL_SECS: i64 = 10;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("identity {identity} already has an open session at venue {venue}")]
    AlreadyCheckedIn { identity: Uuid, venue: Venue },
    #[error("identity {identity} has no open session at venue {venue}")]
    NoOpenSession { identity: Uuid, venue: Venue },
    #[error("dwell time not reached: {elapsed_ms} ms of {dwell_ms} ms")]
    DwellNotReached { elapsed_ms: i64, dwell_ms: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    NotCheckedIn,
    CheckedIn,
    CheckedOut,
}

/// Key of an attendance session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub identity_id: Uuid,
    pub venue: Venue,
}

/// One visit of an identity at a venue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceSession {
    pub identity_id: Uuid,
    pub venue: Venue,
    /// 1-based visit counter per key.
    pub visit: u32,
    pub checkin_time: DateTime<Utc>,
    pub checkout_time: Option<DateTime<Utc>>,
}

impl AttendanceSession {
    pub fn key(&self) -> SessionKey {
        SessionKey {
            identity_id: self.identity_id,
            venue: self.venue.clone(),
        }
    }

    pub fn state(&self) -> SessionState {
        if self.checkout_time.is_some() {
            SessionState::CheckedOut
        } else {
            SessionState::CheckedIn
        }
    }

    pub fn is_open(&self) -> bool {
        self.checkout_time.is_none()
    }
}

/// Timing rules for the state machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttendancePolicy {
    /// Checkout requires strictly more than this since check-in.
    pub dwell_min: TimeDelta,
    /// When set, a checked-out key opens a new visit once this much time
    /// has passed since checkout. When unset, checkout is terminal.
    pub reentry_cooldown: Option<TimeDelta>,
}

impl Default for AttendancePolicy {
    fn default() -> Self {
        Self {
            dwell_min: TimeDelta::seconds(DEFAULT_DWELL_SECS),
            reentry_cooldown: None,
        }
    }
}

/// What a positive identification does to a key's latest session.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Open a new session.
    CheckIn(AttendanceSession),
    /// Close the open session.
    CheckOut(AttendanceSession),
    /// No change; carries the current state.
    Hold(SessionState),
}

/// Open a session for `key`. Fails if `latest` is still open.
pub fn check_in(
    key: &SessionKey,
    latest: Option<&AttendanceSession>,
    now: DateTime<Utc>,
) -> Result<AttendanceSession, SessionError> {
    if latest.is_some_and(AttendanceSession::is_open) {
        return Err(SessionError::AlreadyCheckedIn {
            identity: key.identity_id,
            venue: key.venue.clone(),
        });
    }
    Ok(next_visit(key, latest, now))
}

fn next_visit(
    key: &SessionKey,
    latest: Option<&AttendanceSession>,
    now: DateTime<Utc>,
) -> AttendanceSession {
    AttendanceSession {
        identity_id: key.identity_id,
        venue: key.venue.clone(),
        visit: latest.map_or(1, |s| s.visit + 1),
        checkin_time: now,
        checkout_time: None,
    }
}

/// Close `session` at `now`. Fails if it is not open or the dwell has not
/// elapsed.
pub fn check_out(
    key: &SessionKey,
    session: Option<&AttendanceSession>,
    now: DateTime<Utc>,
    policy: &AttendancePolicy,
) -> Result<AttendanceSession, SessionError> {
    let open = session
        .filter(|s| s.is_open())
        .ok_or_else(|| SessionError::NoOpenSession {
            identity: key.identity_id,
            venue: key.venue.clone(),
        })?;

    let elapsed = now - open.checkin_time;
    if elapsed <= policy.dwell_min {
        return Err(SessionError::DwellNotReached {
            elapsed_ms: elapsed.num_milliseconds(),
            dwell_ms: policy.dwell_min.num_milliseconds(),
        });
    }

    Ok(AttendanceSession {
        checkout_time: Some(now),
        ..open.clone()
    })
}

/// Decide the transition for a positive identification of `key` at `now`.
pub fn on_identified(
    key: &SessionKey,
    latest: Option<&AttendanceSession>,
    now: DateTime<Utc>,
    policy: &AttendancePolicy,
) -> Transition {
    match latest {
        None => Transition::CheckIn(next_visit(key, None, now)),
        Some(open) if open.is_open() => match check_out(key, Some(open), now, policy) {
            Ok(closed) => Transition::CheckOut(closed),
            Err(_) => Transition::Hold(SessionState::CheckedIn),
        },
        Some(closed) => {
            let reentry_due = match (policy.reentry_cooldown, closed.checkout_time) {
                (Some(cooldown), Some(out)) => now - out > cooldown,
                _ => false,
            };
            if reentry_due {
                Transition::CheckIn(next_visit(key, Some(closed), now))
            } else {
                Transition::Hold(SessionState::CheckedOut)
            }
        }
    }
}
