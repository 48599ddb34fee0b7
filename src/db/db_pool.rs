use duckdb::Connection;
use r2d2::ManageConnection;
use std::sync::{Arc, Mutex};

/// r2d2 manager handing out connections to a single DuckDB database.
///
/// DuckDB allows one read-write process per file, so every pooled connection
/// is a clone of one base connection; this also makes `:memory:` pools share
/// their data.
pub struct DuckDBConnectionManager {
    base: Arc<Mutex<Connection>>,
}

impl DuckDBConnectionManager {
    pub fn new(connection_string: &str) -> Result<Self, duckdb::Error> {
        let conn = if connection_string == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(connection_string)?
        };
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            base: Arc::new(Mutex::new(conn)),
        }
    }
}

impl ManageConnection for DuckDBConnectionManager {
    type Connection = Connection;
    type Error = duckdb::Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        // A poisoned lock only means another thread panicked mid-clone; the
        // base connection itself is still usable.
        let base = self.base.lock().unwrap_or_else(|e| e.into_inner());
        base.try_clone()
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.execute("SELECT 1", [])?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}
