use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct UserID(i64);

impl From<i64> for UserID {
    fn from(raw: i64) -> Self {
        UserID(raw)
    }
}

impl std::fmt::Display for UserID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The closed set of account kinds. Checked at the authorization boundary of each operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Guest,
    Host,
    Admin,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Role::Guest => "guest",
            Role::Host => "host",
            Role::Admin => "admin",
        })
    }
}

#[derive(Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserID,
    pub name: String,
    pub email: String,
    pub role: Role,
    #[serde(skip_serializing)]
    pub api_token: String,
    pub created_at: DateTime<Utc>,
}

mod model {
    use sqlx::Executor;

    use crate::{
        error::Error,
        model::database::{Database, DatabaseProvider},
    };

    use super::{Role, User, UserID};

    impl User {
        /// Inserts an account and issues its bearer token.
        pub async fn register(
            pool: &Database,
            name: &str,
            email: &str,
            role: Role,
        ) -> Result<User, Error> {
            let email = email.trim().to_lowercase();
            let name = name.trim().to_string();
            if email.is_empty() || name.is_empty() {
                return Err(Error::InvalidRequest("name and email are required".into()));
            }
            let token = nanoid::nanoid!(32);
            let attempt = sqlx::query(
                "INSERT INTO users (name, email, role, api_token, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(&name)
            .bind(&email)
            .bind(role)
            .bind(&token)
            .bind(chrono::Utc::now())
            .execute(&pool.0)
            .await;
            match attempt {
                Ok(res) => {
                    tracing::info!(target: "users.register", user_id = res.last_insert_rowid(), %email, %role, "user registered");
                    User::retrieve(UserID::from(res.last_insert_rowid()), pool).await
                }
                Err(err) if Error::is_unique_violation(&err) => Err(Error::InvalidRequest(
                    format!("{email} is already registered"),
                )),
                Err(err) => Err(err.into()),
            }
        }

        pub async fn from_token(pool: &Database, token: &str) -> Result<Option<User>, Error> {
            let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE api_token = ?1")
                .bind(token)
                .fetch_optional(&pool.0)
                .await?;
            Ok(user)
        }

        pub async fn from_email(pool: &Database, email: &str) -> Result<Option<User>, Error> {
            tracing::debug!(email = %email, "lookup user by email");
            let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ?1")
                .bind(email.trim().to_lowercase())
                .fetch_optional(&pool.0)
                .await?;
            Ok(user)
        }
    }

    impl std::fmt::Debug for User {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("User")
                .field("id", &self.id)
                .field("name", &self.name)
                .field("email", &self.email)
                .field("role", &self.role)
                .field("api_token", &"[REDACTED]")
                .finish()
        }
    }

    impl DatabaseProvider for User {
        type Id = UserID;

        async fn initialise_table(pool: Database) -> Result<Database, Error> {
            let creation_attempt = pool
                .0
                .execute(
                    "
      CREATE TABLE if not exists users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        email TEXT NOT NULL UNIQUE,
        role TEXT NOT NULL CHECK (role IN ('guest', 'host', 'admin')),
        api_token TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL
      )
      ",
                )
                .await;
            match creation_attempt {
                Ok(_) => Ok(pool),
                Err(_) => Err(Error::Database(
                    "Failed to create user database tables".into(),
                )),
            }
        }

        async fn retrieve(id: Self::Id, pool: &Database) -> Result<Self, Error> {
            sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?1")
                .bind(id)
                .fetch_optional(&pool.0)
                .await?
                .ok_or(Error::NotFound("user"))
        }
    }
}

mod control {
    use axum::{Json, Router, extract::State, routing::get};

    use crate::{
        appstate::AppState,
        controller::{RouteProvider, auth::Actor},
        error::Error,
        model::database::DatabaseProvider,
    };

    use super::User;

    impl RouteProvider for User {
        fn provide_routes(router: Router<AppState>) -> Router<AppState> {
            router.route("/me", get(User::me))
        }
    }

    impl User {
        pub async fn me(actor: Actor, State(state): State<AppState>) -> Result<Json<User>, Error> {
            let user = User::retrieve(actor.user_id, &state.pool).await?;
            Ok(Json(user))
        }
    }
}
