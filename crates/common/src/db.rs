//! SQLite access to the account and instance tables
//!
//! The backend that issues accounts and runs containers owns these tables
//! and their schema; `open` attaches read-only and never touches either.
//! Only the in-memory database used for tests and local seeding creates
//! the tables itself.

use crate::registry::{InstanceRegistry, PrincipalStore};
use crate::types::{InstanceDescriptor, InstanceStatus, Principal, Role};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database wrapper for collaborator lookups
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open the backend's database file read-only.
    ///
    /// The file must already exist; the proxy never creates or migrates it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path.as_ref(), flags)?;
        // The backend writes concurrently; wait instead of failing on its locks.
        conn.busy_timeout(BUSY_TIMEOUT)?;

        info!("Opened database at {:?} (read-only)", path.as_ref());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database with the tables created (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL DEFAULT '',
                role TEXT NOT NULL DEFAULT 'USER',
                created_at TEXT
            );

            CREATE TABLE IF NOT EXISTS miner_instances (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id),
                status TEXT NOT NULL DEFAULT 'STOPPED',
                port INTEGER,
                created_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_miner_instances_user ON miner_instances(user_id);
            "#,
        )?;

        Ok(())
    }

    /// Insert or replace an account row.
    pub fn upsert_user(&self, id: &str, username: &str, role: Role) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO users (id, username, role) VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET username = excluded.username, role = excluded.role
            "#,
            params![id, username, role.to_string().to_ascii_uppercase()],
        )?;
        debug!("Upserted user {} ({})", id, role);
        Ok(())
    }

    /// Insert or replace an instance row.
    pub fn upsert_instance(
        &self,
        id: &str,
        owner_id: &str,
        status: InstanceStatus,
        port: Option<u16>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO miner_instances (id, user_id, status, port) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                status = excluded.status,
                port = excluded.port
            "#,
            params![
                id,
                owner_id,
                status.to_string().to_ascii_uppercase(),
                port.map(i64::from)
            ],
        )?;
        debug!("Upserted instance {} status={} port={:?}", id, status, port);
        Ok(())
    }

    fn get_principal(&self, id: &str) -> Result<Option<Principal>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, username, role FROM users WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((id, display_name, role)) => Ok(Some(Principal {
                id,
                display_name,
                role: role.parse()?,
            })),
            None => Ok(None),
        }
    }

    fn find_instance(&self, instance_id: &str, requester: &Principal) -> Result<Option<InstanceDescriptor>> {
        let conn = self.conn.lock();
        let row = if requester.is_elevated() {
            conn.query_row(
                "SELECT id, user_id, status, port FROM miner_instances WHERE id = ?1",
                params![instance_id],
                raw_instance,
            )
            .optional()?
        } else {
            conn.query_row(
                "SELECT id, user_id, status, port FROM miner_instances WHERE id = ?1 AND user_id = ?2",
                params![instance_id, requester.id],
                raw_instance,
            )
            .optional()?
        };

        row.map(RawInstance::into_descriptor).transpose()
    }
}

struct RawInstance {
    id: String,
    owner_id: String,
    status: String,
    port: Option<i64>,
}

fn raw_instance(row: &Row<'_>) -> rusqlite::Result<RawInstance> {
    Ok(RawInstance {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        status: row.get(2)?,
        port: row.get(3)?,
    })
}

impl RawInstance {
    fn into_descriptor(self) -> Result<InstanceDescriptor> {
        let port = self
            .port
            .map(|p| {
                u16::try_from(p).map_err(|_| Error::InvalidValue {
                    field: "port",
                    value: p.to_string(),
                })
            })
            .transpose()?;

        Ok(InstanceDescriptor {
            id: self.id,
            owner_id: self.owner_id,
            status: self.status.parse()?,
            port,
        })
    }
}

#[async_trait]
impl PrincipalStore for Database {
    async fn principal(&self, id: &str) -> Result<Option<Principal>> {
        self.get_principal(id)
    }
}

#[async_trait]
impl InstanceRegistry for Database {
    async fn find(
        &self,
        instance_id: &str,
        requester: &Principal,
    ) -> Result<Option<InstanceDescriptor>> {
        self.find_instance(instance_id, requester)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(id: &str, role: Role) -> Principal {
        Principal {
            id: id.to_string(),
            display_name: id.to_string(),
            role,
        }
    }

    fn seeded() -> Database {
        let db = Database::open_memory().unwrap();
        db.upsert_user("u1", "alice", Role::User).unwrap();
        db.upsert_user("u2", "bob", Role::User).unwrap();
        db.upsert_user("root", "admin", Role::Admin).unwrap();
        db.upsert_instance("i1", "u1", InstanceStatus::Running, Some(7000)).unwrap();
        db.upsert_instance("i2", "u2", InstanceStatus::Stopped, None).unwrap();
        db
    }

    #[tokio::test]
    async fn test_principal_lookup() {
        let db = seeded();
        let alice = db.principal("u1").await.unwrap().unwrap();
        assert_eq!(alice.display_name, "alice");
        assert_eq!(alice.role, Role::User);

        let admin = db.principal("root").await.unwrap().unwrap();
        assert!(admin.is_elevated());

        assert!(db.principal("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_owner_filter_for_standard_users() {
        let db = seeded();
        let alice = principal("u1", Role::User);

        let own = db.find("i1", &alice).await.unwrap().unwrap();
        assert_eq!(own.running_port(), Some(7000));

        // Someone else's instance looks exactly like a missing one.
        assert!(db.find("i2", &alice).await.unwrap().is_none());
        assert!(db.find("nope", &alice).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_admin_sees_every_instance() {
        let db = seeded();
        let admin = principal("root", Role::Admin);

        let other = db.find("i2", &admin).await.unwrap().unwrap();
        assert_eq!(other.owner_id, "u2");
        assert_eq!(other.status, InstanceStatus::Stopped);
        assert_eq!(other.running_port(), None);
    }

    /// A file laid out the way the backend's own migrations leave it.
    fn backend_file(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("app.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL,
                max_invite_codes INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE miner_instances (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                miner_type TEXT NOT NULL,
                container_id TEXT,
                status TEXT NOT NULL,
                port INTEGER
            );
            INSERT INTO users VALUES ('u1', 'alice', 'x', 'USER', 3);
            INSERT INTO miner_instances VALUES ('i1', 'u1', 'cpu', 'c0ffee', 'RUNNING', 7000);
            "#,
        )
        .unwrap();
        path
    }

    fn schema_objects(path: &Path) -> Vec<String> {
        let conn = Connection::open(path).unwrap();
        let mut stmt = conn
            .prepare("SELECT type || ':' || name FROM sqlite_master ORDER BY type, name")
            .unwrap();
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .collect::<rusqlite::Result<Vec<_>>>()
            .unwrap();
        names
    }

    #[tokio::test]
    async fn test_open_reads_backend_file_without_changing_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = backend_file(&dir);
        let before = schema_objects(&path);

        let db = Database::open(&path).unwrap();
        let alice = db.principal("u1").await.unwrap().unwrap();
        assert_eq!(alice.display_name, "alice");
        let instance = db.find("i1", &alice).await.unwrap().unwrap();
        assert_eq!(instance.running_port(), Some(7000));
        drop(db);

        assert_eq!(schema_objects(&path), before);
    }

    #[test]
    fn test_open_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = backend_file(&dir);

        let db = Database::open(&path).unwrap();
        assert!(matches!(
            db.upsert_user("u2", "bob", Role::User),
            Err(Error::Database(_))
        ));
    }

    #[test]
    fn test_open_does_not_create_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("app.db");

        assert!(Database::open(&path).is_err());
        assert!(!path.exists());
        assert!(!path.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn test_rows_written_by_backend_are_parsed() {
        let db = Database::open_memory().unwrap();
        {
            let conn = db.conn.lock();
            conn.execute_batch(
                r#"
                INSERT INTO users (id, username, password_hash, role) VALUES ('u9', 'carol', 'x', 'ADMIN');
                INSERT INTO miner_instances (id, user_id, status, port) VALUES ('i9', 'u9', 'RUNNING', 5003);
                INSERT INTO miner_instances (id, user_id, status, port) VALUES ('bad', 'u9', 'RUNNING', 99999);
                "#,
            )
            .unwrap();
        }

        let carol = db.principal("u9").await.unwrap().unwrap();
        assert_eq!(carol.role, Role::Admin);

        let instance = db.find("i9", &carol).await.unwrap().unwrap();
        assert_eq!(instance.running_port(), Some(5003));

        assert!(matches!(
            db.find("bad", &carol).await,
            Err(Error::InvalidValue { field: "port", .. })
        ));
    }
}
