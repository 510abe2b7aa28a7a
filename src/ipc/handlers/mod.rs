pub mod attendance;
pub mod backup;
pub mod classes;
pub mod core;
pub mod distributions;
pub mod promotion;
pub mod results;
pub mod schools;
pub mod scores;
pub mod sessions;
pub mod setup;
pub mod students;
pub mod subjects;
pub mod teachers;
