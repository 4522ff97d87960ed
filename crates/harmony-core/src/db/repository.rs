//! Emergency and pending-operation repositories

use crate::error::{Error, Result};
use crate::models::{Emergency, EmergencyId, EmergencyStatus, OperationKind, PendingOperation};
use libsql::{params, Connection};

/// Trait for emergency storage operations (async)
#[allow(async_fn_in_trait)]
pub trait EmergencyRepository {
    /// Persist a new emergency record
    async fn insert(&self, emergency: &Emergency) -> Result<()>;

    /// Get an emergency by local ID
    async fn get(&self, id: &EmergencyId) -> Result<Option<Emergency>>;

    /// Get an emergency by server-assigned ID
    async fn find_by_server_id(&self, server_id: i64) -> Result<Option<Emergency>>;

    /// Find a record with the same origin and creation instant (broadcast de-dup)
    async fn find_duplicate(&self, elderly_id: i64, created_at: i64) -> Result<Option<Emergency>>;

    /// List active emergencies, newest first
    async fn list_active(&self) -> Result<Vec<Emergency>>;

    /// List emergencies regardless of status, newest first
    async fn list(&self, limit: usize) -> Result<Vec<Emergency>>;

    /// Record the server-assigned ID after the server confirms creation
    async fn assign_server_id(&self, id: &EmergencyId, server_id: i64) -> Result<()>;

    /// Apply a status transition, enforcing the state machine and the
    /// volunteer-id invariant
    async fn set_status(
        &self,
        id: &EmergencyId,
        next: EmergencyStatus,
        volunteer_id: Option<i64>,
    ) -> Result<Emergency>;

    /// Merge a server-confirmed record by server ID: update the existing
    /// row or insert a new one
    async fn upsert_by_server_id(&self, emergency: &Emergency) -> Result<Emergency>;

    /// Count records already confirmed by the server
    async fn count_confirmed(&self) -> Result<i64>;
}

/// libSQL implementation of `EmergencyRepository`
pub struct LibSqlEmergencyRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlEmergencyRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse an emergency from a database row
    fn parse_emergency(row: &libsql::Row) -> Result<Emergency> {
        let id: String = row.get(0)?;
        let status: String = row.get(7)?;
        Ok(Emergency {
            id: id
                .parse()
                .map_err(|_| Error::Malformed(format!("invalid emergency id: {id}")))?,
            server_id: row.get::<Option<i64>>(1)?,
            elderly_id: row.get(2)?,
            volunteer_id: row.get::<Option<i64>>(3)?,
            latitude: row.get(4)?,
            longitude: row.get(5)?,
            created_at: row.get(6)?,
            status: status.parse()?,
        })
    }

    async fn query_one(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<Option<Emergency>> {
        let mut rows = self.conn.query(sql, params).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_emergency(&row)?)),
            None => Ok(None),
        }
    }

    async fn query_many(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<Vec<Emergency>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut emergencies = Vec::new();
        while let Some(row) = rows.next().await? {
            emergencies.push(Self::parse_emergency(&row)?);
        }
        Ok(emergencies)
    }
}

const EMERGENCY_COLUMNS: &str =
    "id, server_id, elderly_id, volunteer_id, latitude, longitude, created_at, status";

impl EmergencyRepository for LibSqlEmergencyRepository<'_> {
    async fn insert(&self, emergency: &Emergency) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO emergencies
                 (id, server_id, elderly_id, volunteer_id, latitude, longitude, created_at, status)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    emergency.id.as_str(),
                    emergency.server_id,
                    emergency.elderly_id,
                    emergency.volunteer_id,
                    emergency.latitude,
                    emergency.longitude,
                    emergency.created_at,
                    emergency.status.as_str()
                ],
            )
            .await?;
        Ok(())
    }

    async fn get(&self, id: &EmergencyId) -> Result<Option<Emergency>> {
        self.query_one(
            &format!("SELECT {EMERGENCY_COLUMNS} FROM emergencies WHERE id = ?"),
            params![id.as_str()],
        )
        .await
    }

    async fn find_by_server_id(&self, server_id: i64) -> Result<Option<Emergency>> {
        self.query_one(
            &format!("SELECT {EMERGENCY_COLUMNS} FROM emergencies WHERE server_id = ?"),
            params![server_id],
        )
        .await
    }

    async fn find_duplicate(&self, elderly_id: i64, created_at: i64) -> Result<Option<Emergency>> {
        self.query_one(
            &format!(
                "SELECT {EMERGENCY_COLUMNS} FROM emergencies
                 WHERE elderly_id = ? AND created_at = ?"
            ),
            params![elderly_id, created_at],
        )
        .await
    }

    async fn list_active(&self) -> Result<Vec<Emergency>> {
        self.query_many(
            &format!(
                "SELECT {EMERGENCY_COLUMNS} FROM emergencies
                 WHERE status = 'active'
                 ORDER BY created_at DESC"
            ),
            (),
        )
        .await
    }

    async fn list(&self, limit: usize) -> Result<Vec<Emergency>> {
        self.query_many(
            &format!(
                "SELECT {EMERGENCY_COLUMNS} FROM emergencies
                 ORDER BY created_at DESC
                 LIMIT ?"
            ),
            params![limit as i64],
        )
        .await
    }

    async fn assign_server_id(&self, id: &EmergencyId, server_id: i64) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE emergencies SET server_id = ? WHERE id = ?",
                params![server_id, id.as_str()],
            )
            .await?;

        if rows == 0 {
            return Err(Error::NotFound(id.to_string()));
        }

        Ok(())
    }

    async fn set_status(
        &self,
        id: &EmergencyId,
        next: EmergencyStatus,
        volunteer_id: Option<i64>,
    ) -> Result<Emergency> {
        let current = self
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        if !current.status.can_transition_to(next) {
            return Err(Error::InvalidTransition(format!(
                "{} -> {next}",
                current.status
            )));
        }

        // volunteer_id is set iff status is accepted/completed
        let volunteer = match next {
            EmergencyStatus::Accepted => Some(volunteer_id.ok_or_else(|| {
                Error::InvalidInput("acceptance requires a volunteer id".to_string())
            })?),
            EmergencyStatus::Completed => current.volunteer_id,
            EmergencyStatus::Active | EmergencyStatus::Cancelled => None,
        };

        self.conn
            .execute(
                "UPDATE emergencies SET status = ?, volunteer_id = ? WHERE id = ?",
                params![next.as_str(), volunteer, id.as_str()],
            )
            .await?;

        self.get(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    async fn upsert_by_server_id(&self, emergency: &Emergency) -> Result<Emergency> {
        let Some(server_id) = emergency.server_id else {
            return Err(Error::InvalidInput(
                "upsert requires a server-confirmed record".to_string(),
            ));
        };

        if let Some(existing) = self.find_by_server_id(server_id).await? {
            self.conn
                .execute(
                    "UPDATE emergencies SET status = ?, volunteer_id = ? WHERE server_id = ?",
                    params![
                        emergency.status.as_str(),
                        emergency.volunteer_id,
                        server_id
                    ],
                )
                .await?;
            return self
                .get(&existing.id)
                .await?
                .ok_or_else(|| Error::NotFound(existing.id.to_string()));
        }

        self.insert(emergency).await?;
        Ok(emergency.clone())
    }

    async fn count_confirmed(&self) -> Result<i64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM emergencies WHERE server_id IS NOT NULL",
                (),
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }
}

/// Trait for the durable pending-operation queue (async)
#[allow(async_fn_in_trait)]
pub trait PendingOperationRepository {
    /// Append an operation; insertion order defines replay order
    async fn enqueue(&self, kind: &OperationKind, payload: &str) -> Result<PendingOperation>;

    /// List all pending operations in FIFO insertion order
    async fn list_fifo(&self) -> Result<Vec<PendingOperation>>;

    /// Remove an operation after the coordinator confirms remote application
    async fn delete(&self, id: i64) -> Result<()>;

    /// Number of queued operations
    async fn count(&self) -> Result<i64>;
}

/// libSQL implementation of `PendingOperationRepository`
pub struct LibSqlPendingOperationRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlPendingOperationRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_operation(row: &libsql::Row) -> Result<PendingOperation> {
        let kind: String = row.get(1)?;
        Ok(PendingOperation {
            id: row.get(0)?,
            kind: OperationKind::parse(&kind),
            payload: row.get(2)?,
            created_at: row.get(3)?,
        })
    }
}

impl PendingOperationRepository for LibSqlPendingOperationRepository<'_> {
    async fn enqueue(&self, kind: &OperationKind, payload: &str) -> Result<PendingOperation> {
        let created_at = crate::util::now_millis();
        self.conn
            .execute(
                "INSERT INTO pending_operations (kind, payload, created_at) VALUES (?, ?, ?)",
                params![kind.as_str(), payload, created_at],
            )
            .await?;

        Ok(PendingOperation {
            id: self.conn.last_insert_rowid(),
            kind: kind.clone(),
            payload: payload.to_string(),
            created_at,
        })
    }

    async fn list_fifo(&self) -> Result<Vec<PendingOperation>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, kind, payload, created_at FROM pending_operations ORDER BY id ASC",
                (),
            )
            .await?;

        let mut operations = Vec::new();
        while let Some(row) = rows.next().await? {
            operations.push(Self::parse_operation(&row)?);
        }
        Ok(operations)
    }

    async fn delete(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM pending_operations WHERE id = ?", params![id])
            .await?;
        Ok(())
    }

    async fn count(&self) -> Result<i64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM pending_operations", ())
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }
}
