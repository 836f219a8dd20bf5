pub mod disabled;
pub mod file;
pub mod groups;
pub mod history;

pub use disabled::DisabledUserStore;
pub use groups::GroupBackupStore;
pub use history::IpHistoryStore;
