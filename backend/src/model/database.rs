use std::ops::Deref;

use sqlx::{
    Pool, Sqlite,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};

use crate::error::Error;

#[derive(Clone, Debug)]
pub struct Database(pub Pool<Sqlite>);

impl Database {
    pub async fn new_with_filename(filename: &str) -> Result<Self, Error> {
        let opt = SqliteConnectOptions::new()
            .filename(filename)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        // SQLite has a single writer; one connection keeps transactions from racing on lock upgrade.
        match SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opt)
            .await
        {
            Ok(pool) => Ok(Database(pool)),
            Err(err) => Err(Error::Database(format!(
                "Failed to open database {filename}: {err}"
            ))),
        }
    }
}

impl Deref for Database {
    type Target = Pool<Sqlite>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

pub trait DatabaseComponent
where
    Self: Sized,
{
    async fn initialise_table<T: DatabaseProvider>(self) -> Result<Self, Error>;
}

pub trait DatabaseProvider
where
    Self: Sized,
{
    type Id;
    async fn initialise_table(pool: Database) -> Result<Database, Error>;
    async fn retrieve(id: Self::Id, pool: &Database) -> Result<Self, Error>;
}

impl DatabaseComponent for Database {
    async fn initialise_table<T: DatabaseProvider>(self) -> Result<Self, Error> {
        T::initialise_table(self).await
    }
}

impl Database {
    /// Creates every table the service uses, in foreign-key order.
    pub async fn initialise_all(self) -> Result<Self, Error> {
        use crate::plugins::{
            bookings::Booking, listings::Listing, payments::Payment, users::User,
        };
        self.initialise_table::<User>()
            .await?
            .initialise_table::<Listing>()
            .await?
            .initialise_table::<Booking>()
            .await?
            .initialise_table::<Payment>()
            .await
    }
}
