use crate::infrastructure::error::InfraError;
use rusqlite::Connection;
use std::path::Path;

const SCHEMA_SQL: &str = include_str!("../../sql/schema.sql");

pub fn initialize_database(path: &Path) -> Result<(), InfraError> {
    let connection = Connection::open(path)?;
    connection.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

pub fn open_connection(path: &Path) -> Result<Connection, InfraError> {
    let connection = Connection::open(path)?;
    connection.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(connection)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_engine_tables() {
        let path = std::env::temp_dir().join(format!(
            "focusforge-storage-tests-{}.sqlite",
            std::process::id()
        ));
        initialize_database(&path).expect("initialize database");
        initialize_database(&path).expect("schema is idempotent");

        let connection = open_connection(&path).expect("open");
        let mut statement = connection
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .expect("prepare");
        let tables = statement
            .query_map([], |row| row.get::<_, String>(0))
            .expect("query")
            .collect::<Result<Vec<_>, _>>()
            .expect("collect");
        drop(statement);
        drop(connection);
        let _ = std::fs::remove_file(&path);

        for expected in ["pomodoro_sessions", "profiles", "tasks", "time_tracking_sessions"] {
            assert!(tables.iter().any(|name| name == expected), "missing {expected}");
        }
    }
}
