use std::str::FromStr;

use rusqlite::{params, Connection};

use crate::db::DatabaseError;
use crate::models::{ChatTurn, Role};

/// Append one history entry for a session.
pub fn append_history(
    conn: &Connection,
    session_id: &str,
    role: Role,
    content: &str,
) -> Result<(), DatabaseError> {
    let next_seq: i64 = conn.query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM history WHERE session_id = ?1",
        params![session_id],
        |row| row.get(0),
    )?;

    conn.execute(
        "INSERT INTO history (session_id, seq, role, content, at)
         VALUES (?1, ?2, ?3, ?4, datetime('now'))",
        params![session_id, next_seq, role.as_str(), content],
    )?;
    Ok(())
}

/// The most recent `limit` history entries for a session, oldest first.
pub fn recent_history(
    conn: &Connection,
    session_id: &str,
    limit: usize,
) -> Result<Vec<ChatTurn>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT role, content FROM (
             SELECT seq, role, content FROM history
             WHERE session_id = ?1 ORDER BY seq DESC LIMIT ?2
         ) ORDER BY seq ASC",
    )?;

    let rows = stmt.query_map(params![session_id, limit as i64], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut turns = Vec::new();
    for row in rows {
        let (role, content) = row?;
        turns.push(ChatTurn { role: Role::from_str(&role)?, text: content });
    }
    Ok(turns)
}
