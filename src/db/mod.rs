// SQLite storage: ticks, minute bars, trade log, financial metric cache
pub mod sqlite;

pub use sqlite::SqliteStorage;
