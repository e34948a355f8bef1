use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::DatabaseError;

/// One guardrail incident, persisted append-only with a hashed user id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub hashed_user_id: String,
    pub kind: String,
    pub severity: String,
    pub detail: String,
}

impl Incident {
    pub fn new(
        hashed_user_id: impl Into<String>,
        kind: impl Into<String>,
        severity: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            at: Utc::now(),
            hashed_user_id: hashed_user_id.into(),
            kind: kind.into(),
            severity: severity.into(),
            detail: detail.into(),
        }
    }
}

/// Append an incident. Incidents are never updated or deleted here;
/// archival is an operational policy outside the core.
pub fn insert_incident(conn: &Connection, incident: &Incident) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO incidents (id, at, hashed_user_id, kind, severity, detail)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            incident.id.to_string(),
            incident.at.to_rfc3339(),
            incident.hashed_user_id,
            incident.kind,
            incident.severity,
            incident.detail,
        ],
    )?;
    Ok(())
}

/// Incidents recorded at or after `since`, oldest first.
pub fn incidents_since(
    conn: &Connection,
    since: DateTime<Utc>,
) -> Result<Vec<Incident>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, at, hashed_user_id, kind, severity, detail
         FROM incidents WHERE at >= ?1 ORDER BY at ASC",
    )?;

    let rows = stmt.query_map(params![since.to_rfc3339()], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
        ))
    })?;

    let mut incidents = Vec::new();
    for row in rows {
        let (id, at, hashed_user_id, kind, severity, detail) = row?;
        incidents.push(Incident {
            id: Uuid::parse_str(&id)
                .map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))?,
            at: DateTime::parse_from_rfc3339(&at)
                .map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))?
                .with_timezone(&Utc),
            hashed_user_id,
            kind,
            severity,
            detail,
        });
    }
    Ok(incidents)
}
