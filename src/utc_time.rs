use chrono::{DateTime, Utc};

pub type UtcDateTime = DateTime<Utc>;
