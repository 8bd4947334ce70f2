#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};

/// Connection pool for whichever SQL database `database_url` names.
///
/// Opening runs the bundled migrations, so every store sharing the pool sees
/// the same schema.
#[derive(Debug, Clone)]
pub enum Database {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

impl Database {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;
			Ok(Database::Sqlite(pool))
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			Ok(Database::Postgres(pool))
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			let pool = sqlx::MySqlPool::connect(database_url).await.context("connect mysql")?;
			sqlx::migrate!("migrations/mysql")
				.run(&pool)
				.await
				.context("run mysql migrations")?;
			Ok(Database::Mysql(pool))
		} else {
			Err(anyhow!("unsupported database_url (use sqlite:, postgres:, mysql:)"))
		}
	}

	pub fn driver(&self) -> &'static str {
		match self {
			Database::Sqlite(_) => "sqlite",
			Database::Postgres(_) => "postgres",
			Database::Mysql(_) => "mysql",
		}
	}
}
