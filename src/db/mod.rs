//! Database module: entity models and SQL repositories.
//!
//! - `model`: row types returned by repositories.
//! - `repo`: pool setup, migrations and the key-value table.
//! - `jobs`: SQL for the job queue and recurring triggers.
//!
//! External modules import from `autopost::db`; the repository API is
//! re-exported here.

pub mod jobs;
pub mod model;
pub mod repo;

pub use jobs::*;
pub use model::{JobRecord, JobStatus, RecurringRecord};
pub use repo::*;
