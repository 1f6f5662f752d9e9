/// Opaque identifier produced by [`UniqueId`](crate::unique_id::UniqueId).
pub type Id = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
