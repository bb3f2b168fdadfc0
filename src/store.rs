//! Lead, message, and interaction store.
//!
//! SQLite-backed, keyed by normalized phone. The call and SMS paths only
//! touch it through the lookup/append operations here; each operation is
//! its own transaction.

use crate::error::{AgentError, Result};
use crate::phone::PhoneNumber;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

/// A contact record. Exposed to personas and call context; written only
/// through `update_lead` / `log_interaction`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Lead {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub company: String,
    pub title: String,
    pub notes: String,
    pub status: String,
    pub sentiment: String,
    pub autopilot_disabled: bool,
}

impl Lead {
    /// Display name, falling back to the phone number.
    #[must_use]
    pub fn full_name(&self) -> String {
        let name = format!("{} {}", self.first_name, self.last_name);
        let name = name.trim();
        if name.is_empty() {
            self.phone.clone()
        } else {
            name.to_owned()
        }
    }

    /// Context pairs for persona/prompt substitution.
    #[must_use]
    pub fn context_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![("CALLER_NAME".to_owned(), self.full_name())];
        if !self.first_name.is_empty() {
            pairs.push(("CALLER_FIRST_NAME".to_owned(), self.first_name.clone()));
        }
        if !self.company.is_empty() {
            pairs.push(("CALLER_COMPANY".to_owned(), self.company.clone()));
        }
        if !self.title.is_empty() {
            pairs.push(("CALLER_TITLE".to_owned(), self.title.clone()));
        }
        if !self.notes.is_empty() {
            pairs.push(("CALLER_NOTES".to_owned(), self.notes.clone()));
        }
        if !self.status.is_empty() {
            pairs.push(("CALLER_STATUS".to_owned(), self.status.clone()));
        }
        if !self.sentiment.is_empty() {
            pairs.push(("CALLER_SENTIMENT".to_owned(), self.sentiment.clone()));
        }
        pairs
    }
}

/// Fields `update_lead` may change; `None` leaves a field untouched.
#[derive(Debug, Default)]
pub struct LeadUpdate {
    pub status: Option<String>,
    pub sentiment: Option<String>,
    pub notes: Option<String>,
    pub last_contacted_at: Option<String>,
}

/// A stored SMS/email message. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub channel: String,
    pub direction: String,
    pub from_address: String,
    pub to_address: String,
    pub body: String,
    pub thread_id: String,
    pub status: String,
    pub created_at: String,
}

/// A call/SMS interaction logged against a lead.
#[derive(Debug, Clone, Default)]
pub struct Interaction {
    pub channel: String,
    pub direction: String,
    pub duration_seconds: i64,
    pub recording_path: Option<String>,
    pub transcript: Option<String>,
    pub summary: Option<String>,
    pub objective: Option<String>,
    pub outcome: String,
}

/// Shared SQLite store handle.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (and migrate) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| AgentError::Store(format!("cannot open {}: {e}", path.display())))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        info!("store ready at {}", path.display());
        Ok(store)
    }

    /// In-memory store for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AgentError::Store(format!("cannot open memory db: {e}")))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS leads (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    first_name TEXT NOT NULL DEFAULT '',
                    last_name TEXT NOT NULL DEFAULT '',
                    email TEXT NOT NULL DEFAULT '',
                    phone TEXT NOT NULL DEFAULT '',
                    phone_normalized TEXT NOT NULL DEFAULT '',
                    company TEXT NOT NULL DEFAULT '',
                    title TEXT NOT NULL DEFAULT '',
                    notes TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'NEW',
                    sentiment TEXT NOT NULL DEFAULT '',
                    autopilot_disabled INTEGER NOT NULL DEFAULT 0,
                    last_contacted_at TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_leads_phone ON leads(phone_normalized);
                CREATE INDEX IF NOT EXISTS idx_leads_status ON leads(status);

                CREATE TABLE IF NOT EXISTS messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    channel TEXT NOT NULL,
                    direction TEXT NOT NULL,
                    from_address TEXT NOT NULL,
                    to_address TEXT NOT NULL,
                    body TEXT NOT NULL,
                    thread_id TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id);

                CREATE TABLE IF NOT EXISTS interactions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    lead_id INTEGER NOT NULL,
                    channel TEXT NOT NULL,
                    direction TEXT NOT NULL,
                    duration_seconds INTEGER NOT NULL DEFAULT 0,
                    recording_path TEXT,
                    transcript TEXT,
                    summary TEXT,
                    objective TEXT,
                    outcome TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL,
                    FOREIGN KEY (lead_id) REFERENCES leads(id)
                );
                CREATE INDEX IF NOT EXISTS idx_interactions_lead ON interactions(lead_id);",
            )
            .map_err(store_err)
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|e| AgentError::Store(format!("store lock poisoned: {e}")))?;
        f(&guard)
    }

    /// Insert a lead; the phone is normalized for lookups.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn add_lead(&self, lead: &Lead) -> Result<i64> {
        let normalized = PhoneNumber::normalize(&lead.phone);
        let now = Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO leads (first_name, last_name, email, phone, phone_normalized,
                                    company, title, notes, status, sentiment,
                                    autopilot_disabled, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
                params![
                    lead.first_name,
                    lead.last_name,
                    lead.email,
                    lead.phone,
                    normalized.digits(),
                    lead.company,
                    lead.title,
                    lead.notes,
                    if lead.status.is_empty() {
                        "NEW"
                    } else {
                        lead.status.as_str()
                    },
                    lead.sentiment,
                    lead.autopilot_disabled,
                    now,
                ],
            )
            .map_err(store_err)?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Look up a lead by any spelling of its phone number.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn get_lead_by_phone(&self, phone: &PhoneNumber) -> Result<Option<Lead>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE phone_normalized = ?1"),
                params![phone.digits()],
                lead_from_row,
            )
            .optional()
            .map_err(store_err)
        })
    }

    /// Substring search over name, company, and phone.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn search_leads(&self, query: &str, limit: usize) -> Result<Vec<Lead>> {
        let pattern = format!("%{}%", query.trim());
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {LEAD_COLUMNS} FROM leads
                     WHERE first_name LIKE ?1 COLLATE NOCASE
                        OR last_name LIKE ?1 COLLATE NOCASE
                        OR company LIKE ?1 COLLATE NOCASE
                        OR phone LIKE ?1
                     ORDER BY updated_at DESC LIMIT ?2"
                ))
                .map_err(store_err)?;
            let rows = stmt
                .query_map(params![pattern, limit as i64], lead_from_row)
                .map_err(store_err)?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(store_err)
        })
    }

    /// Apply the non-`None` fields of `update` to a lead.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn update_lead(&self, id: i64, update: &LeadUpdate) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            if let Some(status) = &update.status {
                conn.execute(
                    "UPDATE leads SET status = ?1, updated_at = ?2 WHERE id = ?3",
                    params![status, now, id],
                )
                .map_err(store_err)?;
            }
            if let Some(sentiment) = &update.sentiment {
                conn.execute(
                    "UPDATE leads SET sentiment = ?1, updated_at = ?2 WHERE id = ?3",
                    params![sentiment, now, id],
                )
                .map_err(store_err)?;
            }
            if let Some(notes) = &update.notes {
                conn.execute(
                    "UPDATE leads SET notes = ?1, updated_at = ?2 WHERE id = ?3",
                    params![notes, now, id],
                )
                .map_err(store_err)?;
            }
            if let Some(ts) = &update.last_contacted_at {
                conn.execute(
                    "UPDATE leads SET last_contacted_at = ?1, updated_at = ?2 WHERE id = ?3",
                    params![ts, now, id],
                )
                .map_err(store_err)?;
            }
            Ok(())
        })
    }

    /// Whether automatic replies are suppressed for this thread.
    #[must_use]
    pub fn is_autopilot_disabled(&self, phone: &PhoneNumber) -> bool {
        self.get_lead_by_phone(phone)
            .ok()
            .flatten()
            .map(|lead| lead.autopilot_disabled)
            .unwrap_or(false)
    }

    /// Total lead count.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn lead_count(&self) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM leads", [], |row| row.get(0))
                .map_err(store_err)
        })
    }

    /// Append a message. `thread_id` defaults to the remote party's
    /// normalized number.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn save_message(
        &self,
        channel: &str,
        direction: &str,
        from: &str,
        to: &str,
        body: &str,
        status: &str,
    ) -> Result<i64> {
        let thread = if direction == "inbound" {
            PhoneNumber::normalize(from)
        } else {
            PhoneNumber::normalize(to)
        };
        let now = Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (channel, direction, from_address, to_address,
                                       body, thread_id, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![channel, direction, from, to, body, thread.digits(), status, now],
            )
            .map_err(store_err)?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Recent messages to/from a number, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn conversation_messages(&self, phone: &PhoneNumber, limit: usize) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, channel, direction, from_address, to_address, body,
                            thread_id, status, created_at
                     FROM messages WHERE thread_id = ?1
                     ORDER BY id DESC LIMIT ?2",
                )
                .map_err(store_err)?;
            let rows = stmt
                .query_map(params![phone.digits(), limit as i64], |row| {
                    Ok(Message {
                        id: row.get(0)?,
                        channel: row.get(1)?,
                        direction: row.get(2)?,
                        from_address: row.get(3)?,
                        to_address: row.get(4)?,
                        body: row.get(5)?,
                        thread_id: row.get(6)?,
                        status: row.get(7)?,
                        created_at: row.get(8)?,
                    })
                })
                .map_err(store_err)?;
            let mut messages: Vec<Message> =
                rows.collect::<std::result::Result<_, _>>().map_err(store_err)?;
            messages.reverse();
            Ok(messages)
        })
    }

    /// Log a call/SMS interaction against a lead.
    ///
    /// # Errors
    ///
    /// Returns an error on a database failure.
    pub fn log_interaction(&self, lead_id: i64, interaction: &Interaction) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO interactions (lead_id, channel, direction, duration_seconds,
                                           recording_path, transcript, summary, objective,
                                           outcome, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    lead_id,
                    interaction.channel,
                    interaction.direction,
                    interaction.duration_seconds,
                    interaction.recording_path,
                    interaction.transcript,
                    interaction.summary,
                    interaction.objective,
                    interaction.outcome,
                    now,
                ],
            )
            .map_err(store_err)?;
            Ok(conn.last_insert_rowid())
        })
    }
}

const LEAD_COLUMNS: &str = "id, first_name, last_name, email, phone, company, title, notes, \
                            status, sentiment, autopilot_disabled";

fn lead_from_row(row: &Row<'_>) -> rusqlite::Result<Lead> {
    Ok(Lead {
        id: row.get(0)?,
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        email: row.get(3)?,
        phone: row.get(4)?,
        company: row.get(5)?,
        title: row.get(6)?,
        notes: row.get(7)?,
        status: row.get(8)?,
        sentiment: row.get(9)?,
        autopilot_disabled: row.get(10)?,
    })
}

fn store_err(e: rusqlite::Error) -> AgentError {
    AgentError::Store(e.to_string())
}
