use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::AppointmentStatus;

/// A persisted clinic appointment.
///
/// Unique by `id`; at most one `scheduled` entry may exist per
/// (date, time, provider) slot; the store enforces this atomically.
/// The id is shown to the patient and acts as the capability for
/// cancel/modify.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Uuid,
    pub patient_name: String,
    pub phone: String,
    pub reason: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub provider: String,
    pub status: AppointmentStatus,
    pub created_at: NaiveDateTime,
}

/// Fields accepted by `AppointmentStore::create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppointmentRequest {
    pub patient_name: String,
    pub phone: String,
    pub reason: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub provider: Option<String>,
}

/// Optional filters for `AppointmentStore::list`.
#[derive(Debug, Clone, Default)]
pub struct AppointmentFilter {
    pub patient_name: Option<String>,
    pub date: Option<NaiveDate>,
    pub status: Option<AppointmentStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appointment_serializes_with_status() {
        let appt = Appointment {
            id: Uuid::new_v4(),
            patient_name: "John Smith".into(),
            phone: "0901234567".into(),
            reason: "checkup".into(),
            date: NaiveDate::from_ymd_opt(2026, 3, 10).unwrap(),
            time: NaiveTime::from_hms_opt(14, 0, 0).unwrap(),
            provider: "Dr. Phong".into(),
            status: AppointmentStatus::Scheduled,
            created_at: NaiveDateTime::default(),
        };
        let json = serde_json::to_string(&appt).unwrap();
        assert!(json.contains("\"scheduled\""));
        assert!(json.contains("John Smith"));
    }
}
