pub mod aggregate;
pub mod directory;
pub mod fetch;
pub mod schedule;

pub use directory::{DirectoryMaps, DirectoryResolver};
pub use fetch::AppointmentFetcher;
pub use schedule::ScheduleService;
