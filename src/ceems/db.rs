use crate::error::LbError;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const DB_FILE: &str = "ceems.db";

/// Read-only handle to the API server's pre-populated database.
///
/// The connection is opened without SQLite's internal mutex and serialised
/// behind our own lock instead; request-path queries run on the blocking
/// pool so they never stall the proxy tasks.
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open `<dir>/ceems.db` read-only with a 5 s busy timeout.
    pub fn open(dir: &Path) -> Result<Self, LbError> {
        let path = dir.join(DB_FILE);
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;

        tracing::info!("db: opened read-only, path={}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory_with(schema_and_rows: &str) -> Self {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(schema_and_rows).unwrap();
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Decide whether `user` may see `uuids` in `cluster_id` at the
    /// reference time (seconds since epoch).
    ///
    /// Admins (member of any admin-users list) are always allowed, which
    /// covers the empty-uuid case; everyone else must own every queried
    /// unit, where owning means a `units` row in the cluster with
    /// `usr = user` that had started by the reference time. An empty uuid
    /// list is denied for non-admins.
    pub async fn verify_ownership(
        &self,
        user: &str,
        cluster_id: &str,
        uuids: &[String],
        time_secs: u64,
    ) -> Result<bool, LbError> {
        let conn = self.conn.clone();
        let user = user.to_string();
        let cluster_id = cluster_id.to_string();
        let uuids = uuids.to_vec();
        // `units.started_at_ts` is stored in milliseconds.
        let time_millis = (time_secs as i64).saturating_mul(1000);

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("db mutex poisoned");
            if is_admin(&conn, &user)? {
                return Ok(true);
            }
            if uuids.is_empty() {
                return Ok(false);
            }
            owns_all(&conn, &user, &cluster_id, &uuids, time_millis)
        })
        .await
        .map_err(|e| LbError::Internal(format!("verification task failed: {}", e)))?
    }

    /// DISTINCT cluster ids present in the units table, for startup
    /// validation of the configured clusters.
    pub async fn cluster_ids(&self) -> Result<Vec<String>, LbError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("db mutex poisoned");
            let mut stmt = conn.prepare("SELECT DISTINCT cluster_id FROM units")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(ids)
        })
        .await
        .map_err(|e| LbError::Internal(format!("cluster id query failed: {}", e)))?
    }
}

fn is_admin(conn: &Connection, user: &str) -> Result<bool, LbError> {
    let mut stmt = conn.prepare("SELECT users FROM admin_users")?;
    let lists = stmt.query_map([], |row| row.get::<_, String>(0))?;
    for list in lists {
        if admin_list_contains(&list?, user) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// The users column holds either a JSON string array or a comma-separated
/// list; membership is an exact name match either way.
fn admin_list_contains(list: &str, user: &str) -> bool {
    if let Ok(names) = serde_json::from_str::<Vec<String>>(list) {
        return names.iter().any(|n| n == user);
    }
    list.split(',').any(|n| n.trim() == user)
}

fn owns_all(
    conn: &Connection,
    user: &str,
    cluster_id: &str,
    uuids: &[String],
    time_millis: i64,
) -> Result<bool, LbError> {
    let placeholders = (0..uuids.len())
        .map(|i| format!("?{}", i + 4))
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "SELECT COUNT(DISTINCT uuid) FROM units \
         WHERE cluster_id = ?1 AND usr = ?2 AND started_at_ts <= ?3 AND uuid IN ({placeholders})"
    );

    let mut values: Vec<rusqlite::types::Value> = Vec::with_capacity(uuids.len() + 3);
    values.push(cluster_id.to_string().into());
    values.push(user.to_string().into());
    values.push(time_millis.into());
    for uuid in uuids {
        values.push(uuid.clone().into());
    }

    let mut stmt = conn.prepare(&sql)?;
    let count: i64 = stmt.query_row(rusqlite::params_from_iter(values.iter()), |row| row.get(0))?;
    Ok(count as usize == uuids.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &str = r#"
        CREATE TABLE units (
            id INTEGER PRIMARY KEY,
            cluster_id TEXT NOT NULL,
            uuid TEXT NOT NULL,
            project TEXT,
            usr TEXT NOT NULL,
            started_at_ts INTEGER NOT NULL
        );
        CREATE TABLE users (cluster_id TEXT, name TEXT, projects TEXT);
        CREATE TABLE admin_users (source TEXT, users TEXT);

        INSERT INTO units (cluster_id, uuid, project, usr, started_at_ts)
            VALUES ('rm-0', '1479763', 'p1', 'usr1', 1735045414000);
        INSERT INTO units (cluster_id, uuid, project, usr, started_at_ts)
            VALUES ('rm-0', '1479765', 'p2', 'usr2', 1735045414000);
        INSERT INTO units (cluster_id, uuid, project, usr, started_at_ts)
            VALUES ('rm-1', '9000001', 'p3', 'usr1', 1735045414000);
        INSERT INTO admin_users (source, users) VALUES ('ceems', '["adm1","adm2"]');
    "#;

    fn db() -> Database {
        Database::open_in_memory_with(SCHEMA)
    }

    fn uuids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_owner_allowed() {
        let allowed = db()
            .verify_ownership("usr1", "rm-0", &uuids(&["1479763"]), 1735045414)
            .await
            .unwrap();
        assert!(allowed);
    }

    #[tokio::test]
    async fn test_non_owner_denied() {
        let allowed = db()
            .verify_ownership("usr1", "rm-0", &uuids(&["1479765"]), 1735045414)
            .await
            .unwrap();
        assert!(!allowed);
    }

    #[tokio::test]
    async fn test_partial_ownership_denied() {
        let allowed = db()
            .verify_ownership("usr1", "rm-0", &uuids(&["1479763", "1479765"]), 1735045414)
            .await
            .unwrap();
        assert!(!allowed);
    }

    #[tokio::test]
    async fn test_unit_in_other_cluster_denied() {
        let allowed = db()
            .verify_ownership("usr1", "rm-0", &uuids(&["9000001"]), 1735045414)
            .await
            .unwrap();
        assert!(!allowed);
    }

    #[tokio::test]
    async fn test_unit_started_after_reference_time_denied() {
        let allowed = db()
            .verify_ownership("usr1", "rm-0", &uuids(&["1479763"]), 1735045413)
            .await
            .unwrap();
        assert!(!allowed);
    }

    #[tokio::test]
    async fn test_admin_override() {
        let allowed = db()
            .verify_ownership("adm1", "rm-0", &uuids(&["1479765", "1481510"]), 1735045414)
            .await
            .unwrap();
        assert!(allowed);
    }

    #[tokio::test]
    async fn test_empty_uuids_admin_only() {
        let d = db();
        assert!(d.verify_ownership("adm1", "rm-0", &[], 1735045414).await.unwrap());
        assert!(!d.verify_ownership("usr1", "rm-0", &[], 1735045414).await.unwrap());
    }

    #[tokio::test]
    async fn test_cluster_ids_distinct() {
        let mut ids = db().cluster_ids().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["rm-0", "rm-1"]);
    }

    #[test]
    fn test_admin_list_formats() {
        assert!(admin_list_contains(r#"["adm1","adm2"]"#, "adm1"));
        assert!(!admin_list_contains(r#"["adm10"]"#, "adm1"));
        assert!(admin_list_contains("adm1, adm2", "adm2"));
        assert!(!admin_list_contains("adm10", "adm1"));
    }
}
