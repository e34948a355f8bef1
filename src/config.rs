use std::path::PathBuf;

/// Application-level constants
pub const APP_NAME: &str = "Mediq";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The clinic profile served by the conversation and appointment agents.
/// A deployment overrides these through `ClinicProfile::default()` edits or
/// its own constructor; agents only ever see the struct.
#[derive(Debug, Clone)]
pub struct ClinicProfile {
    pub name: &'static str,
    pub phone: &'static str,
    pub address: &'static str,
    /// Human-readable opening hours, shown in FAQ answers.
    pub hours_text: &'static str,
    /// National emergency number quoted in redirect messages.
    pub emergency_number: &'static str,
    pub providers: &'static [&'static str],
    /// Appointment slot length in minutes; slots start on this grid.
    pub slot_minutes: u32,
    /// Weekday opening window (hour, inclusive start / exclusive end).
    pub weekday_hours: (u32, u32),
    /// Saturday opening window; clinic closed on Sunday.
    pub saturday_hours: (u32, u32),
    /// Bookings accepted at most this many days ahead.
    pub max_booking_days_ahead: i64,
}

impl Default for ClinicProfile {
    fn default() -> Self {
        Self {
            name: "Gemidical Clinic",
            phone: "1900 1836",
            address: "120 Yen Lang, Kien An",
            hours_text: "Mon-Fri 9:00-17:00, Sat 9:00-12:00",
            emergency_number: "115",
            providers: &["Dr. Phong", "Dr. Dong", "Dr. Manh", "Dr. Phuoc", "Dr. Quang"],
            slot_minutes: 15,
            weekday_hours: (9, 17),
            saturday_hours: (9, 12),
            max_booking_days_ahead: 180,
        }
    }
}

/// Get the application data directory (~/Mediq/ on all platforms).
pub fn app_data_dir() -> PathBuf {
    let home = dirs::home_dir().expect("Cannot determine home directory");
    home.join("Mediq")
}

/// Default location of the appointments/incidents database.
pub fn database_path() -> PathBuf {
    app_data_dir().join("mediq.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_data_dir_under_home() {
        let dir = app_data_dir();
        let home = dirs::home_dir().unwrap();
        assert!(dir.starts_with(home));
        assert!(dir.ends_with("Mediq"));
    }

    #[test]
    fn default_profile_has_providers_and_hours() {
        let profile = ClinicProfile::default();
        assert!(!profile.providers.is_empty());
        assert!(profile.weekday_hours.0 < profile.weekday_hours.1);
        assert!(profile.saturday_hours.1 <= profile.weekday_hours.1);
        assert_eq!(profile.emergency_number, "115");
    }

    #[test]
    fn app_version_matches_cargo() {
        assert_eq!(APP_VERSION, "0.1.0");
    }
}
