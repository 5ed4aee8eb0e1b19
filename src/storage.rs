use crate::api::events::{MessageSnapshot, Subscription};
use crate::api::models::{ConversationStatus, ConversationSummary, Message, SummaryUpdate};
use crate::error::{ReadError, ResolutionError, SubscriptionError, WriteError};
use crate::store::{ChatStore, RoleDirectory};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::{Connection, OptionalExtension, params};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

const CHANGE_BUFFER: usize = 64;

pub fn default_path() -> Option<PathBuf> {
    let proj = ProjectDirs::from("com", "apna-adda", "adda-support")?;
    Some(proj.data_dir().join("support.sqlite"))
}

fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Local document store with the same layout as the hosted one: a summary row
/// per conversation, an append-only message table and a role table.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    changes: broadcast::Sender<String>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        if let Err(e) = ensure_dir(path) {
            log::warn!("could not create {}: {e}", path.display());
        }
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> rusqlite::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> rusqlite::Result<Self> {
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                user_email TEXT,
                last_message TEXT NOT NULL DEFAULT '',
                last_updated_at TEXT,
                status TEXT NOT NULL DEFAULT 'new',
                unread_by_admin INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                text TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS messages_by_conversation
                ON messages (conversation_id, timestamp, seq);
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                role TEXT
            );
            "#,
        )?;
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            changes,
        })
    }

    pub fn set_role(&self, uid: &str, role: &str) -> Result<(), WriteError> {
        with_conn(&self.conn, |conn| {
            conn.execute(
                "INSERT INTO users (id, role) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET role = excluded.role",
                params![uid, role],
            )
        })
        .map(|_| ())
        .map_err(WriteError::Rejected)
    }

    pub fn conversation(&self, conversation_id: &str) -> Result<Option<ConversationSummary>, ReadError> {
        with_conn(&self.conn, |conn| {
            conn.query_row(
                "SELECT id, user_email, last_message, last_updated_at, status, unread_by_admin
                 FROM conversations WHERE id = ?1",
                params![conversation_id],
                summary_from_row,
            )
            .optional()
        })
        .map_err(ReadError::Unreachable)
    }
}

fn with_conn<T>(
    conn: &Mutex<Connection>,
    f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
) -> Result<T, String> {
    let mut guard = conn.lock().map_err(|_| "connection lock poisoned".to_string())?;
    f(&mut guard).map_err(|e| e.to_string())
}

// Message ids are the zero-padded row sequence so that id order matches
// insertion order when timestamps tie.
fn message_id(seq: i64) -> String {
    format!("{seq:020}")
}

fn summary_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationSummary> {
    let status: String = row.get(4)?;
    Ok(ConversationSummary {
        id: row.get(0)?,
        user_email: row.get(1)?,
        last_message: row.get(2)?,
        last_updated_at: row.get(3)?,
        status: ConversationStatus::parse(&status).unwrap_or_default(),
        unread_by_admin: row.get(5)?,
    })
}

fn load_messages(conn: &Mutex<Connection>, conversation_id: &str) -> Result<Vec<Message>, ReadError> {
    with_conn(conn, |conn| {
        let mut stmt = conn.prepare(
            "SELECT seq, text, sender_id, timestamp FROM messages
             WHERE conversation_id = ?1 ORDER BY timestamp ASC, seq ASC",
        )?;
        let rows = stmt.query_map(params![conversation_id], |row| {
            Ok(Message {
                id: message_id(row.get(0)?),
                text: row.get(1)?,
                sender_id: row.get(2)?,
                timestamp: row.get(3)?,
            })
        })?;
        let messages = rows.collect::<rusqlite::Result<Vec<_>>>();
        messages
    })
    .map_err(ReadError::Unreachable)
}

#[async_trait]
impl ChatStore for SqliteStore {
    fn subscribe(&self, conversation_id: &str) -> Subscription {
        let conn = self.conn.clone();
        // Registered before the first read so no append can slip between them.
        let mut changes = self.changes.subscribe();
        let id = conversation_id.to_string();
        Subscription::spawn(conversation_id, move |sink| async move {
            let mut attempts = 0;
            loop {
                let item = match load_messages(&conn, &id) {
                    Ok(messages) => {
                        attempts = 0;
                        Ok(MessageSnapshot {
                            conversation_id: id.clone(),
                            messages,
                        })
                    }
                    Err(source) => {
                        attempts += 1;
                        Err(SubscriptionError::Interrupted { attempts, source })
                    }
                };
                if !sink.deliver(item).await {
                    return;
                }
                loop {
                    match changes.recv().await {
                        Ok(changed) if changed == id => break,
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            log::debug!("feed for {id} lagged by {skipped} change(s)");
                            break;
                        }
                        Err(RecvError::Closed) => return,
                    }
                }
            }
        })
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        text: &str,
        sender_id: &str,
    ) -> Result<String, WriteError> {
        let seq = with_conn(&self.conn, |conn| {
            let tx = conn.transaction()?;
            let latest: Option<DateTime<Utc>> = tx.query_row(
                "SELECT MAX(timestamp) FROM messages WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )?;
            let now = Utc::now();
            let timestamp = latest.map_or(now, |latest| latest.max(now));
            tx.execute(
                "INSERT INTO messages (conversation_id, text, sender_id, timestamp)
                 VALUES (?1, ?2, ?3, ?4)",
                params![conversation_id, text, sender_id, timestamp],
            )?;
            let seq = tx.last_insert_rowid();
            tx.commit()?;
            Ok(seq)
        })
        .map_err(WriteError::Rejected)?;
        // No receivers is fine; nobody is watching.
        let _ = self.changes.send(conversation_id.to_string());
        Ok(message_id(seq))
    }

    async fn upsert_conversation_summary(
        &self,
        conversation_id: &str,
        update: &SummaryUpdate,
    ) -> Result<(), WriteError> {
        let status = update.status.map(|s| s.as_str());
        with_conn(&self.conn, |conn| {
            conn.execute(
                r#"
                INSERT INTO conversations
                    (id, user_email, last_message, last_updated_at, status, unread_by_admin)
                VALUES (?1, ?2, COALESCE(?3, ''), ?4, COALESCE(?5, 'new'), COALESCE(?6, 0))
                ON CONFLICT(id) DO UPDATE SET
                    user_email = COALESCE(?2, user_email),
                    last_message = COALESCE(?3, last_message),
                    last_updated_at = ?4,
                    status = COALESCE(?5, status),
                    unread_by_admin = COALESCE(?6, unread_by_admin)
                "#,
                params![
                    conversation_id,
                    update.user_email,
                    update.last_message,
                    Utc::now(),
                    status,
                    update.unread_by_admin,
                ],
            )
        })
        .map(|_| ())
        .map_err(WriteError::Rejected)
    }

    async fn conversation_summary(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationSummary>, ReadError> {
        self.conversation(conversation_id)
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ReadError> {
        with_conn(&self.conn, |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_email, last_message, last_updated_at, status, unread_by_admin
                 FROM conversations ORDER BY last_updated_at DESC, id ASC",
            )?;
            let rows = stmt.query_map([], summary_from_row)?;
            let summaries = rows.collect::<rusqlite::Result<Vec<_>>>();
            summaries
        })
        .map_err(ReadError::Unreachable)
    }
}

#[async_trait]
impl RoleDirectory for SqliteStore {
    async fn role_of(&self, uid: &str) -> Result<Option<String>, ResolutionError> {
        let role = with_conn(&self.conn, |conn| {
            conn.query_row("SELECT role FROM users WHERE id = ?1", params![uid], |row| {
                row.get::<_, Option<String>>(0)
            })
            .optional()
        })
        .map_err(ReadError::Unreachable)?;
        Ok(role.flatten())
    }
}
