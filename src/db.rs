use std::future::Future;

use deadpool_postgres::{Config, Object, Pool, PoolConfig, Runtime, Timeouts};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tracing::{debug, error, info};

use crate::config::DatabaseConfig;
use crate::error::DatabaseError;

/// Connectivity check used by the health endpoints.
///
/// `Database` is the production implementation; tests substitute their own.
pub trait DatabaseProbe: Send + Sync + 'static {
    /// Runs a trivial query on a freshly acquired session.
    fn ping(&self) -> impl Future<Output = Result<(), DatabaseError>> + Send;
}

/// PostgreSQL connection pool shared by all requests.
#[derive(Clone)]
pub struct Database {
    pool: Pool,
}

/// A pooled connection checked out for one unit of work.
///
/// The connection goes back to the pool when the session is dropped, on every exit path.
pub struct Session {
    client: Object,
}

impl Database {
    /// Builds the pool. Connections are opened lazily on first checkout.
    pub fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let url = connection_url(&config.url);
        if let Err(e) = url.parse::<tokio_postgres::Config>() {
            error!(error = %e, "database.invalid_url");
            return Err(DatabaseError::query(format!(
                "DATABASE_URL is not a valid PostgreSQL connection string: {e}"
            )));
        }

        if config.max_connections() == 0 {
            return Err(DatabaseError::query("Connection pool must allow at least one connection"));
        }

        let mut pg_config = Config::new();
        pg_config.url = Some(url);

        pg_config.manager = Some(deadpool_postgres::ManagerConfig {
            recycling_method: deadpool_postgres::RecyclingMethod::Verified,
        });

        let mut pool_config = PoolConfig::new(config.max_connections());
        pool_config.timeouts = Timeouts {
            wait: Some(config.pool_timeout),
            create: Some(config.pool_timeout),
            recycle: Some(config.pool_timeout),
        };
        pg_config.pool = Some(pool_config);

        let tls_connector = TlsConnector::builder().build().map_err(|e| {
            error!(error = %e, "database.tls_connector_failed");
            DatabaseError::query(format!("TLS connector creation failed: {e}"))
        })?;
        let tls = MakeTlsConnector::new(tls_connector);

        let pool = pg_config.create_pool(Some(Runtime::Tokio1), tls).map_err(|e| {
            error!(error = %e, "database.pool_creation_failed");
            DatabaseError::query(format!("Connection pool creation failed: {e}"))
        })?;

        info!(
            pool_size = config.pool_size,
            max_overflow = config.max_overflow,
            "database.pool_initialized"
        );
        Ok(Database { pool })
    }

    /// Checks out a session from the pool.
    pub async fn session(&self) -> Result<Session, DatabaseError> {
        let client = self.pool.get().await?;
        Ok(Session { client })
    }

    /// Closes the pool and drops idle connections. Pending checkouts fail.
    pub fn close(&self) {
        let status = self.pool.status();
        self.pool.close();
        info!(
            size = status.size,
            available = status.available,
            "database.pool_disposed"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

/// Drops a `+driver` suffix from the URL scheme, so `postgresql+asyncpg://`
/// connects like `postgresql://`.
fn connection_url(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, rest)) => match scheme.split_once('+') {
            Some((base, _driver)) => format!("{base}://{rest}"),
            None => url.to_string(),
        },
        None => url.to_string(),
    }
}

impl DatabaseProbe for Database {
    async fn ping(&self) -> Result<(), DatabaseError> {
        let session = self.session().await?;
        session.execute("SELECT 1").await?;
        debug!("database.ping_succeeded");
        Ok(())
    }
}

impl Session {
    /// Executes a statement without parameters and returns the affected row count.
    pub async fn execute(&self, statement: &str) -> Result<u64, DatabaseError> {
        self.client
            .execute(statement, &[])
            .await
            .map_err(DatabaseError::from)
    }
}
