use postgres::{Client, Config, Error, NoTls};
use r2d2::ManageConnection;

use crate::infrastructure::postgres::sql_utils;

/// R2D2 connection manager for the synchronous `postgres` client.
#[derive(Debug)]
pub struct PostgresConnectionManager {
    config: Config,
    statement_timeout_secs: u64,
}

impl PostgresConnectionManager {
    pub fn new(config: Config, statement_timeout_secs: u64) -> Self {
        Self {
            config,
            statement_timeout_secs,
        }
    }
}

impl ManageConnection for PostgresConnectionManager {
    type Connection = Client;
    type Error = Error;

    fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let mut client = self.config.connect(NoTls)?;
        client.batch_execute(&sql_utils::session_setup(self.statement_timeout_secs))?;
        Ok(client)
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").map(|_| ())
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.is_closed()
    }
}
