pub mod appointment;
pub mod enums;
pub mod state;

pub use appointment::*;
pub use enums::*;
pub use state::*;
