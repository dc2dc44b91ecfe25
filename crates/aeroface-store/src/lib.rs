//! aeroface-store — SQLite persistence for enrolled embeddings and
//! attendance sessions.
//!
//! One active embedding per identity, replaced in a single UPDATE so no
//! reader ever sees a partial vector. At most one open attendance session
//! per (identity, venue), enforced by a partial unique index.

pub mod cipher;
mod schema;

use aeroface_core::attendance::{AttendanceSession, SessionKey};
use aeroface_core::{Embedding, EnrolledIdentity, IdentityKey, Venue};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

pub use cipher::EmbeddingCipher;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("corrupt record for identity {id}: {message}")]
    Corrupt { id: String, message: String },
    #[error("embedding encryption error: {0}")]
    Encryption(String),
    #[error("identity {0} has an encrypted embedding but no key is configured")]
    KeyRequired(String),
    #[error("store holds {stored}-dim embeddings, refusing a {actual}-dim embedding")]
    DimensionMismatch { stored: usize, actual: usize },
    #[error("identity already has an open session at venue {venue}")]
    SessionConflict { venue: String },
    #[error("no open session (visit {visit}) at venue {venue}")]
    SessionNotOpen { venue: String, visit: u32 },
}

/// Identity row without its embedding payload.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityRecord {
    pub id: Uuid,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub embedding_dim: Option<usize>,
    pub updated_at: DateTime<Utc>,
}

/// Raw identity row as read inside the connection thread.
struct IdentityRow {
    id: String,
    email: Option<String>,
    display_name: Option<String>,
    embedding: Option<Vec<u8>>,
    encrypted: bool,
    model_version: Option<String>,
}

struct SessionRow {
    identity_id: String,
    venue: String,
    visit: u32,
    checkin_time: String,
    checkout_time: Option<String>,
}

/// Handle to the face database. Cheap to share behind an `Arc`.
pub struct FaceStore {
    conn: tokio_rusqlite::Connection,
    cipher: Option<EmbeddingCipher>,
}

impl FaceStore {
    /// Open (creating if needed) the database at `path`.
    pub async fn open(path: &Path, cipher: Option<EmbeddingCipher>) -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open(path).await?;
        conn.call(|conn| {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            Ok(())
        })
        .await?;
        tracing::info!(path = %path.display(), encrypted = cipher.is_some(), "face store opened");
        Self::init(conn, cipher).await
    }

    pub async fn open_in_memory(cipher: Option<EmbeddingCipher>) -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        Self::init(conn, cipher).await
    }

    async fn init(
        conn: tokio_rusqlite::Connection,
        cipher: Option<EmbeddingCipher>,
    ) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch(schema::SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn, cipher })
    }

    /// Replace (or create) the active embedding for `key`.
    ///
    /// Email keys that are not yet known create a new identity. Returns the
    /// identity id. Rejects an embedding whose dimension differs from the
    /// embeddings already stored for other identities.
    pub async fn set_embedding(
        &self,
        key: &IdentityKey,
        display_name: Option<String>,
        embedding: &Embedding,
    ) -> Result<Uuid, StoreError> {
        let plain = embedding.to_le_bytes();
        let (blob, encrypted) = match &self.cipher {
            Some(c) => (c.seal(&plain)?, true),
            None => (plain, false),
        };
        let dim = embedding.dim();
        let model_version = embedding.model_version().map(str::to_string);
        let key = key.clone();
        let now = timestamp(Utc::now());

        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let (lookup, arg) = match &key {
                    IdentityKey::Id(id) => {
                        ("SELECT id FROM identities WHERE id = ?1", id.to_string())
                    }
                    IdentityKey::Email(email) => {
                        ("SELECT id FROM identities WHERE email = ?1", email.clone())
                    }
                };
                let existing: Option<String> =
                    tx.query_row(lookup, [arg], |r| r.get(0)).optional()?;

                let stored_dim: Option<i64> = tx
                    .query_row(
                        "SELECT embedding_dim FROM identities
                         WHERE embedding_dim IS NOT NULL AND id IS NOT ?1 LIMIT 1",
                        [existing.clone()],
                        |r| r.get(0),
                    )
                    .optional()?;
                if let Some(stored) = stored_dim {
                    if stored as usize != dim {
                        return Ok(Err(StoreError::DimensionMismatch {
                            stored: stored as usize,
                            actual: dim,
                        }));
                    }
                }

                let id = match existing {
                    Some(id) => {
                        tx.execute(
                            "UPDATE identities
                             SET embedding = ?2, embedding_dim = ?3, encrypted = ?4,
                                 model_version = ?5,
                                 display_name = COALESCE(?6, display_name), updated_at = ?7
                             WHERE id = ?1",
                            params![
                                id,
                                blob,
                                dim as i64,
                                encrypted,
                                model_version,
                                display_name,
                                now
                            ],
                        )?;
                        id
                    }
                    None => {
                        let (id, email) = match &key {
                            IdentityKey::Id(id) => (id.to_string(), None),
                            IdentityKey::Email(email) => {
                                (Uuid::new_v4().to_string(), Some(email.clone()))
                            }
                        };
                        tx.execute(
                            "INSERT INTO identities
                             (id, email, display_name, embedding, embedding_dim, encrypted,
                              model_version, created_at, updated_at)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                            params![
                                id,
                                email,
                                display_name,
                                blob,
                                dim as i64,
                                encrypted,
                                model_version,
                                now
                            ],
                        )?;
                        id
                    }
                };

                tx.commit()?;
                Ok(Ok(id))
            })
            .await??;

        let id = parse_uuid(&outcome)?;
        tracing::info!(identity = %id, dim, encrypted = self.cipher.is_some(), "embedding stored");
        Ok(id)
    }

    /// Look up an identity by id or email.
    pub async fn find_identity(
        &self,
        key: &IdentityKey,
    ) -> Result<Option<IdentityRecord>, StoreError> {
        let key = key.clone();
        let row = self
            .conn
            .call(move |conn| {
                let (sql, arg) = match &key {
                    IdentityKey::Id(id) => (
                        "SELECT id, email, display_name, embedding_dim, updated_at
                         FROM identities WHERE id = ?1",
                        id.to_string(),
                    ),
                    IdentityKey::Email(email) => (
                        "SELECT id, email, display_name, embedding_dim, updated_at
                         FROM identities WHERE email = ?1",
                        email.clone(),
                    ),
                };
                Ok(conn.query_row(sql, [arg], record_columns).optional()?)
            })
            .await?;
        row.map(into_record).transpose()
    }

    /// The active embedding for `key`, if the identity exists and has one.
    pub async fn get_embedding(&self, key: &IdentityKey) -> Result<Option<Embedding>, StoreError> {
        let key = key.clone();
        let row = self
            .conn
            .call(move |conn| {
                let (sql, arg) = match &key {
                    IdentityKey::Id(id) => {
                        (format!("{} WHERE id = ?1", schema::SELECT_IDENTITY), id.to_string())
                    }
                    IdentityKey::Email(email) => (
                        format!("{} WHERE email = ?1", schema::SELECT_IDENTITY),
                        email.clone(),
                    ),
                };
                Ok(conn.query_row(&sql, [arg], identity_columns).optional()?)
            })
            .await?;

        match row {
            Some(row) => Ok(self.decode(row)?.map(|e| e.embedding)),
            None => Ok(None),
        }
    }

    /// Every identity with a non-null embedding, in enrollment order.
    pub async fn enrolled(&self) -> Result<Vec<EnrolledIdentity>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let sql = format!(
                    "{} WHERE embedding IS NOT NULL ORDER BY created_at, id",
                    schema::SELECT_IDENTITY
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], identity_columns)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(identity) = self.decode(row)? {
                out.push(identity);
            }
        }
        Ok(out)
    }

    /// All identities, enrolled or not.
    pub async fn list_identities(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, email, display_name, embedding_dim, updated_at
                     FROM identities ORDER BY created_at, id",
                )?;
                let rows = stmt
                    .query_map([], record_columns)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(into_record).collect()
    }

    /// The most recent session (open or closed) for `key`.
    pub async fn latest_session(
        &self,
        key: &SessionKey,
    ) -> Result<Option<AttendanceSession>, StoreError> {
        let identity = key.identity_id.to_string();
        let venue = key.venue.as_str().to_string();
        let row = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!(
                            "{} WHERE identity_id = ?1 AND venue = ?2 ORDER BY visit DESC LIMIT 1",
                            schema::SELECT_SESSION
                        ),
                        [identity, venue],
                        session_columns,
                    )
                    .optional()?)
            })
            .await?;
        row.map(into_session).transpose()
    }

    /// Persist a newly opened session.
    pub async fn insert_session(&self, session: &AttendanceSession) -> Result<(), StoreError> {
        let identity = session.identity_id.to_string();
        let venue = session.venue.as_str().to_string();
        let visit = session.visit;
        let checkin = timestamp(session.checkin_time);

        self.conn
            .call(move |conn| {
                let result = conn.execute(
                    "INSERT INTO attendance (identity_id, venue, visit, checkin_time)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![identity, venue, visit, checkin],
                );
                match result {
                    Ok(_) => Ok(Ok(())),
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        Ok(Err(StoreError::SessionConflict { venue }))
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await?
    }

    /// Record the checkout of an open session.
    pub async fn close_session(&self, session: &AttendanceSession) -> Result<(), StoreError> {
        let Some(checkout) = session.checkout_time else {
            return Err(StoreError::SessionNotOpen {
                venue: session.venue.to_string(),
                visit: session.visit,
            });
        };
        let identity = session.identity_id.to_string();
        let venue = session.venue.as_str().to_string();
        let visit = session.visit;
        let checkout = timestamp(checkout);

        let updated = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE attendance SET checkout_time = ?4
                     WHERE identity_id = ?1 AND venue = ?2 AND visit = ?3
                       AND checkout_time IS NULL",
                    params![identity, venue, visit, checkout],
                )?)
            })
            .await?;

        if updated == 0 {
            return Err(StoreError::SessionNotOpen {
                venue: session.venue.to_string(),
                visit,
            });
        }
        Ok(())
    }

    /// Attendance log, oldest check-in first, optionally for one venue.
    pub async fn sessions(
        &self,
        venue: Option<&Venue>,
    ) -> Result<Vec<AttendanceSession>, StoreError> {
        let venue = venue.map(|v| v.as_str().to_string());
        let rows = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "{} WHERE (?1 IS NULL OR venue = ?1) ORDER BY checkin_time, identity_id, visit",
                    schema::SELECT_SESSION
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([venue], session_columns)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(into_session).collect()
    }

    fn decode(&self, row: IdentityRow) -> Result<Option<EnrolledIdentity>, StoreError> {
        let Some(blob) = row.embedding else {
            return Ok(None);
        };
        let plain = if row.encrypted {
            let cipher = self
                .cipher
                .as_ref()
                .ok_or_else(|| StoreError::KeyRequired(row.id.clone()))?;
            cipher.open(&blob)?
        } else {
            blob
        };
        let embedding =
            Embedding::from_le_bytes(&plain, row.model_version).map_err(|e| StoreError::Corrupt {
                id: row.id.clone(),
                message: e.to_string(),
            })?;

        Ok(Some(EnrolledIdentity {
            id: parse_uuid(&row.id)?,
            email: row.email,
            display_name: row.display_name,
            embedding,
        }))
    }
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(id: &str, s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            id: id.to_string(),
            message: format!("bad timestamp '{s}': {e}"),
        })
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Corrupt {
        id: s.to_string(),
        message: format!("bad id: {e}"),
    })
}

type RecordColumns = (String, Option<String>, Option<String>, Option<i64>, String);

fn record_columns(r: &rusqlite::Row<'_>) -> rusqlite::Result<RecordColumns> {
    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
}

fn into_record(
    (id, email, display_name, dim, updated_at): RecordColumns,
) -> Result<IdentityRecord, StoreError> {
    Ok(IdentityRecord {
        id: parse_uuid(&id)?,
        updated_at: parse_time(&id, &updated_at)?,
        email,
        display_name,
        embedding_dim: dim.map(|d| d as usize),
    })
}

fn identity_columns(r: &rusqlite::Row<'_>) -> rusqlite::Result<IdentityRow> {
    Ok(IdentityRow {
        id: r.get(0)?,
        email: r.get(1)?,
        display_name: r.get(2)?,
        embedding: r.get(3)?,
        encrypted: r.get(4)?,
        model_version: r.get(5)?,
    })
}

fn session_columns(r: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        identity_id: r.get(0)?,
        venue: r.get(1)?,
        visit: r.get(2)?,
        checkin_time: r.get(3)?,
        checkout_time: r.get(4)?,
    })
}

fn into_session(row: SessionRow) -> Result<AttendanceSession, StoreError> {
    let id = &row.identity_id;
    Ok(AttendanceSession {
        identity_id: parse_uuid(id)?,
        venue: Venue::new(row.venue).map_err(|e| StoreError::Corrupt {
            id: id.clone(),
            message: e.to_string(),
        })?,
        visit: row.visit,
        checkin_time: parse_time(id, &row.checkin_time)?,
        checkout_time: row.checkout_time.as_deref().map(|t| parse_time(id, t)).transpose()?,
    })
}
