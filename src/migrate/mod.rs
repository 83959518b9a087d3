use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

/// Embedded SQL migration with version, direction, and content.
struct Migration {
    version: u32,
    up_sql: &'static str,
    down_sql: &'static str,
}

/// All embedded migrations, ordered by version.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        up_sql: include_str!("sql/001_init.up.sql"),
        down_sql: include_str!("sql/001_init.down.sql"),
    },
    Migration {
        version: 2,
        up_sql: include_str!("sql/002_app_time_index.up.sql"),
        down_sql: include_str!("sql/002_app_time_index.down.sql"),
    },
];

/// Latest embedded schema version.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

/// Applies embedded SQLite schema migrations.
///
/// Progress is tracked in a single-row `schema_migrations` table holding the
/// current version and a dirty flag set while a migration is running.
pub struct SqliteMigrator<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteMigrator<'a> {
    /// Creates a migrator operating on the given connection.
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Applies all pending forward migrations.
    pub fn up(&self) -> Result<()> {
        self.ensure_migrations_table()?;

        let (current_version, dirty) = self.current_version()?;

        if dirty {
            anyhow::bail!(
                "migration version {current_version} is dirty, manual intervention required"
            );
        }

        let mut applied = 0u32;

        for migration in MIGRATIONS {
            if migration.version <= current_version {
                continue;
            }

            tracing::info!(version = migration.version, "applying migration");

            self.set_version(migration.version, true)?;
            self.execute_sql(migration.up_sql)
                .with_context(|| format!("applying migration version {}", migration.version))?;
            self.set_version(migration.version, false)?;

            applied += 1;
        }

        if applied == 0 {
            tracing::debug!(version = current_version, "no pending migrations");
        } else {
            tracing::info!(version = latest_version(), applied, "migrations completed");
        }

        Ok(())
    }

    /// Rolls back the last applied migration.
    pub fn down(&self) -> Result<()> {
        self.ensure_migrations_table()?;

        let (current_version, _) = self.current_version()?;

        if current_version == 0 {
            tracing::info!("no migrations to roll back");
            return Ok(());
        }

        let migration = MIGRATIONS
            .iter()
            .find(|m| m.version == current_version)
            .with_context(|| format!("migration version {current_version} not found"))?;

        tracing::info!(version = current_version, "rolling back migration");

        self.set_version(current_version, true)?;
        self.execute_sql(migration.down_sql)
            .with_context(|| format!("rolling back migration version {current_version}"))?;

        let prev_version = MIGRATIONS
            .iter()
            .filter(|m| m.version < current_version)
            .map(|m| m.version)
            .max()
            .unwrap_or(0);

        self.set_version(prev_version, false)?;

        tracing::info!(version = prev_version, "rollback completed");

        Ok(())
    }

    /// Returns the current migration version and dirty flag.
    pub fn status(&self) -> Result<(u32, bool)> {
        self.ensure_migrations_table()?;
        self.current_version()
    }

    fn ensure_migrations_table(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER NOT NULL,
                    dirty INTEGER NOT NULL
                )",
                [],
            )
            .context("creating schema_migrations table")?;
        Ok(())
    }

    fn current_version(&self) -> Result<(u32, bool)> {
        let row = self
            .conn
            .query_row(
                "SELECT version, dirty FROM schema_migrations LIMIT 1",
                [],
                |row| Ok((row.get::<_, u32>(0)?, row.get::<_, i64>(1)? != 0)),
            )
            .optional()
            .context("querying migration version")?;

        Ok(row.unwrap_or((0, false)))
    }

    fn set_version(&self, version: u32, dirty: bool) -> Result<()> {
        self.conn
            .execute("DELETE FROM schema_migrations", [])
            .context("clearing schema_migrations")?;
        self.conn
            .execute(
                "INSERT INTO schema_migrations (version, dirty) VALUES (?1, ?2)",
                params![version, i64::from(dirty)],
            )
            .context("inserting migration version")?;
        Ok(())
    }

    fn execute_sql(&self, sql: &str) -> Result<()> {
        for statement in split_statements(sql) {
            self.conn.execute_batch(statement).with_context(|| {
                let preview: String = statement.chars().take(80).collect();
                format!("executing migration statement: {preview}...")
            })?;
        }
        Ok(())
    }
}

/// Splits SQL text into individual statements by semicolons.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}
