//! # Medlar DB
//! Embedded SQLite store — the single owner of all persistent engine state.

pub mod migrations;
pub mod sqlite;

pub use migrations::{MigrationReport, Migrator};
pub use sqlite::SqliteStore;
