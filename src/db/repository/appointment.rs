use std::str::FromStr;
use std::sync::Mutex;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use rusqlite::{params, Connection, TransactionBehavior};
use uuid::Uuid;

use crate::config::ClinicProfile;
use crate::db::DatabaseError;
use crate::models::{Appointment, AppointmentFilter, AppointmentRequest, AppointmentStatus};

/// Durable CRUD over appointments, indexed by id and by (date, time, provider).
///
/// The connection sits behind a mutex so the store is shareable across
/// sessions; conflict-check-then-insert runs inside one immediate
/// transaction, backed by the partial unique index on scheduled slots, so
/// two racing creates for the same slot yield exactly one success.
pub struct AppointmentStore {
    conn: Mutex<Connection>,
    profile: ClinicProfile,
}

impl AppointmentStore {
    pub fn new(conn: Connection, profile: ClinicProfile) -> Self {
        Self { conn: Mutex::new(conn), profile }
    }

    /// Insert a new appointment.
    ///
    /// Fails with [`DatabaseError::SlotConflict`] when another scheduled
    /// appointment already occupies (date, time, provider). A missing
    /// provider defaults to the clinic's first provider so the slot key is
    /// always concrete.
    pub fn create(&self, request: &AppointmentRequest) -> Result<Appointment, DatabaseError> {
        let provider = request
            .provider
            .clone()
            .unwrap_or_else(|| self.profile.providers[0].to_string());

        let appt = Appointment {
            id: Uuid::new_v4(),
            patient_name: request.patient_name.clone(),
            phone: request.phone.clone(),
            reason: request.reason.clone(),
            date: request.date,
            time: request.time,
            provider,
            status: AppointmentStatus::Scheduled,
            created_at: chrono::Local::now().naive_local(),
        };

        let mut conn = self.conn.lock().expect("appointment store poisoned");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let conflict: i64 = tx.query_row(
            "SELECT COUNT(*) FROM appointments
             WHERE date = ?1 AND time = ?2 AND provider = ?3 AND status = 'scheduled'",
            params![
                appt.date.format("%Y-%m-%d").to_string(),
                appt.time.format("%H:%M").to_string(),
                appt.provider,
            ],
            |row| row.get(0),
        )?;
        if conflict > 0 {
            return Err(DatabaseError::SlotConflict {
                date: appt.date.format("%Y-%m-%d").to_string(),
                time: appt.time.format("%H:%M").to_string(),
                provider: appt.provider.clone(),
            });
        }

        let inserted = tx.execute(
            "INSERT INTO appointments
             (id, patient_name, phone, reason, date, time, provider, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                appt.id.to_string(),
                appt.patient_name,
                appt.phone,
                appt.reason,
                appt.date.format("%Y-%m-%d").to_string(),
                appt.time.format("%H:%M").to_string(),
                appt.provider,
                appt.status.as_str(),
                appt.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ],
        );
        match inserted {
            Ok(_) => {}
            // The partial unique index closes the race the COUNT cannot see.
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(DatabaseError::SlotConflict {
                    date: appt.date.format("%Y-%m-%d").to_string(),
                    time: appt.time.format("%H:%M").to_string(),
                    provider: appt.provider.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        }
        tx.commit()?;

        tracing::info!(
            appointment_id = %appt.id,
            date = %appt.date,
            time = %appt.time,
            provider = %appt.provider,
            "Appointment created"
        );
        Ok(appt)
    }

    /// Fetch an appointment by id.
    pub fn get(&self, id: &Uuid) -> Result<Appointment, DatabaseError> {
        let conn = self.conn.lock().expect("appointment store poisoned");
        let row = conn.query_row(
            "SELECT id, patient_name, phone, reason, date, time, provider, status, created_at
             FROM appointments WHERE id = ?1",
            params![id.to_string()],
            row_to_record,
        );
        match row {
            Ok(record) => appointment_from_row(record),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(DatabaseError::NotFound {
                entity_type: "appointment".into(),
                id: id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// List appointments matching the filter, ordered by date then time.
    pub fn list(&self, filter: &AppointmentFilter) -> Result<Vec<Appointment>, DatabaseError> {
        let conn = self.conn.lock().expect("appointment store poisoned");
        let mut sql = String::from(
            "SELECT id, patient_name, phone, reason, date, time, provider, status, created_at
             FROM appointments WHERE 1=1",
        );
        let mut args: Vec<String> = Vec::new();

        if let Some(name) = &filter.patient_name {
            sql.push_str(&format!(" AND patient_name LIKE ?{}", args.len() + 1));
            args.push(format!("%{name}%"));
        }
        if let Some(date) = &filter.date {
            sql.push_str(&format!(" AND date = ?{}", args.len() + 1));
            args.push(date.format("%Y-%m-%d").to_string());
        }
        if let Some(status) = &filter.status {
            sql.push_str(&format!(" AND status = ?{}", args.len() + 1));
            args.push(status.as_str().to_string());
        }
        sql.push_str(" ORDER BY date ASC, time ASC");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), row_to_record)?;

        let mut appointments = Vec::new();
        for row in rows {
            appointments.push(appointment_from_row(row?)?);
        }
        Ok(appointments)
    }

    /// Cancel an appointment by id. Possession of the id authorizes the
    /// change; an external identity boundary may wrap this.
    pub fn cancel(&self, id: &Uuid) -> Result<Appointment, DatabaseError> {
        let existing = self.get(id)?;
        if existing.status == AppointmentStatus::Cancelled {
            return Err(DatabaseError::ConstraintViolation(
                "appointment already cancelled".into(),
            ));
        }

        let conn = self.conn.lock().expect("appointment store poisoned");
        conn.execute(
            "UPDATE appointments SET status = 'cancelled' WHERE id = ?1",
            params![id.to_string()],
        )?;
        drop(conn);

        tracing::info!(appointment_id = %id, "Appointment cancelled");
        self.get(id)
    }

    /// Whether a scheduled appointment occupies the slot.
    pub fn conflict_exists(
        &self,
        date: NaiveDate,
        time: NaiveTime,
        provider: &str,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn.lock().expect("appointment store poisoned");
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM appointments
             WHERE date = ?1 AND time = ?2 AND provider = ?3 AND status = 'scheduled'",
            params![
                date.format("%Y-%m-%d").to_string(),
                time.format("%H:%M").to_string(),
                provider,
            ],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Free slots for a provider on a date, on the clinic's booking grid.
    /// Empty on Sundays.
    pub fn available_slots(
        &self,
        date: NaiveDate,
        provider: &str,
    ) -> Result<Vec<NaiveTime>, DatabaseError> {
        let window = match date.weekday() {
            Weekday::Sun => return Ok(Vec::new()),
            Weekday::Sat => self.profile.saturday_hours,
            _ => self.profile.weekday_hours,
        };

        let conn = self.conn.lock().expect("appointment store poisoned");
        let mut stmt = conn.prepare(
            "SELECT time FROM appointments
             WHERE date = ?1 AND provider = ?2 AND status = 'scheduled'",
        )?;
        let booked: Vec<String> = stmt
            .query_map(
                params![date.format("%Y-%m-%d").to_string(), provider],
                |row| row.get::<_, String>(0),
            )?
            .collect::<Result<_, _>>()?;

        let mut slots = Vec::new();
        let mut minute = window.0 * 60;
        let end = window.1 * 60;
        while minute < end {
            let slot = NaiveTime::from_hms_opt(minute / 60, minute % 60, 0)
                .expect("slot grid within a day");
            if !booked.contains(&slot.format("%H:%M").to_string()) {
                slots.push(slot);
            }
            minute += self.profile.slot_minutes;
        }
        Ok(slots)
    }

    pub fn profile(&self) -> &ClinicProfile {
        &self.profile
    }
}

struct AppointmentRow {
    id: String,
    patient_name: String,
    phone: String,
    reason: String,
    date: String,
    time: String,
    provider: String,
    status: String,
    created_at: String,
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<AppointmentRow> {
    Ok(AppointmentRow {
        id: row.get(0)?,
        patient_name: row.get(1)?,
        phone: row.get(2)?,
        reason: row.get(3)?,
        date: row.get(4)?,
        time: row.get(5)?,
        provider: row.get(6)?,
        status: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn appointment_from_row(row: AppointmentRow) -> Result<Appointment, DatabaseError> {
    Ok(Appointment {
        id: Uuid::parse_str(&row.id)
            .map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))?,
        patient_name: row.patient_name,
        phone: row.phone,
        reason: row.reason,
        date: NaiveDate::parse_from_str(&row.date, "%Y-%m-%d")
            .map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))?,
        time: NaiveTime::parse_from_str(&row.time, "%H:%M")
            .map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))?,
        provider: row.provider,
        status: AppointmentStatus::from_str(&row.status)?,
        created_at: NaiveDateTime::parse_from_str(&row.created_at, "%Y-%m-%d %H:%M:%S")
            .unwrap_or_default(),
    })
}
