pub mod appointment;
pub mod history;
pub mod incident;

pub use appointment::AppointmentStore;
pub use incident::Incident;
