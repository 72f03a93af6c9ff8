// Data models for backend payloads

pub mod dashboard;
pub mod files;
pub mod profile;

pub use dashboard::DashboardStats;
pub use files::FileUpload;
pub use profile::{Address, AddressPatch, NewAddress, PhoneUpdated, ProfileDetails, UserProfile, UsernameUpdated};
