pub mod schedule;
pub mod users;

pub use schedule::ScheduleService;
pub use users::UserService;
