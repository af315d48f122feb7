use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

use crate::plugins::users::UserID;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct ListingID(i64);

impl From<i64> for ListingID {
    fn from(raw: i64) -> Self {
        ListingID(raw)
    }
}

impl std::fmt::Display for ListingID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, FromRow, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub id: ListingID,
    pub host_id: UserID,
    pub title: String,
    pub location: String,
    pub price: f64,
    pub max_guests: i64,
    pub available_from: Option<NaiveDate>,
    pub available_to: Option<NaiveDate>,
    pub available: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Deserialize, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct NewListing {
    pub title: String,
    pub location: String,
    pub price: f64,
    pub max_guests: i64,
    #[serde(default)]
    pub available_from: Option<NaiveDate>,
    #[serde(default)]
    pub available_to: Option<NaiveDate>,
}

/// A host edit; absent fields are left as they are.
#[derive(Clone, Default, Deserialize, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ListingUpdate {
    pub title: Option<String>,
    pub location: Option<String>,
    pub price: Option<f64>,
    pub max_guests: Option<i64>,
    pub available: Option<bool>,
}

fn check_price(price: f64) -> Result<(), crate::error::Error> {
    if price.is_finite() && price > 0.0 {
        Ok(())
    } else {
        Err(crate::error::Error::InvalidRequest(
            "nightly price must be a positive amount".into(),
        ))
    }
}

fn check_max_guests(max_guests: i64) -> Result<(), crate::error::Error> {
    if max_guests >= 1 {
        Ok(())
    } else {
        Err(crate::error::Error::InvalidRequest(
            "a listing must accommodate at least one guest".into(),
        ))
    }
}

mod model {
    use sqlx::{Executor, Sqlite};

    use crate::{
        error::Error,
        model::database::{Database, DatabaseProvider},
        plugins::users::UserID,
    };

    use super::{Listing, ListingID, ListingUpdate, NewListing, check_max_guests, check_price};

    impl Listing {
        pub async fn create(
            pool: &Database,
            host: UserID,
            draft: NewListing,
        ) -> Result<Listing, Error> {
            if draft.title.trim().is_empty() || draft.location.trim().is_empty() {
                return Err(Error::InvalidRequest("title and location are required".into()));
            }
            check_price(draft.price)?;
            check_max_guests(draft.max_guests)?;
            if let (Some(from), Some(to)) = (draft.available_from, draft.available_to) {
                if to <= from {
                    return Err(Error::InvalidRequest(
                        "availableTo must be after availableFrom".into(),
                    ));
                }
            }
            let res = sqlx::query(
                "INSERT INTO listings (
                    host_id, title, location, price, max_guests, available_from, available_to, available, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)",
            )
            .bind(host)
            .bind(draft.title.trim())
            .bind(draft.location.trim())
            .bind(draft.price)
            .bind(draft.max_guests)
            .bind(draft.available_from)
            .bind(draft.available_to)
            .bind(chrono::Utc::now())
            .execute(&pool.0)
            .await?;
            let id = ListingID::from(res.last_insert_rowid());
            tracing::info!(target: "listings.create", listing_id = %id, host_id = %host, "listing created");
            Listing::retrieve(id, pool).await
        }

        pub async fn fetch<'e, E>(exec: E, id: ListingID) -> Result<Option<Listing>, Error>
        where
            E: Executor<'e, Database = Sqlite>,
        {
            let listing = sqlx::query_as::<_, Listing>("SELECT * FROM listings WHERE id = ?1")
                .bind(id)
                .fetch_optional(exec)
                .await?;
            Ok(listing)
        }

        pub async fn by_host(pool: &Database, host: UserID) -> Result<Vec<Listing>, Error> {
            let listings = sqlx::query_as::<_, Listing>(
                "SELECT * FROM listings WHERE host_id = ?1 ORDER BY id DESC LIMIT 100",
            )
            .bind(host)
            .fetch_all(&pool.0)
            .await?;
            Ok(listings)
        }

        /// Applies a host edit. Setting `available` to false is the soft-disable: existing
        /// bookings stay, new ones are refused.
        pub async fn apply_update(
            pool: &Database,
            id: ListingID,
            update: ListingUpdate,
        ) -> Result<Listing, Error> {
            if let Some(price) = update.price {
                check_price(price)?;
            }
            if let Some(max_guests) = update.max_guests {
                check_max_guests(max_guests)?;
            }
            sqlx::query(
                "UPDATE listings SET
                    title = COALESCE(?1, title),
                    location = COALESCE(?2, location),
                    price = COALESCE(?3, price),
                    max_guests = COALESCE(?4, max_guests),
                    available = COALESCE(?5, available)
                 WHERE id = ?6",
            )
            .bind(update.title.as_deref().map(str::trim))
            .bind(update.location.as_deref().map(str::trim))
            .bind(update.price)
            .bind(update.max_guests)
            .bind(update.available)
            .bind(id)
            .execute(&pool.0)
            .await?;
            Listing::retrieve(id, pool).await
        }
    }

    impl DatabaseProvider for Listing {
        type Id = ListingID;

        async fn initialise_table(pool: Database) -> Result<Database, Error> {
            let creation_attempt = pool
                .0
                .execute(
                    "
      CREATE TABLE if not exists listings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        host_id INTEGER NOT NULL REFERENCES users(id),
        title TEXT NOT NULL,
        location TEXT NOT NULL,
        price REAL NOT NULL CHECK (price > 0),
        max_guests INTEGER NOT NULL CHECK (max_guests >= 1),
        available_from TEXT,
        available_to TEXT,
        available INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL
      )
      ",
                )
                .await;
            match creation_attempt {
                Ok(_) => Ok(pool),
                Err(_) => Err(Error::Database(
                    "Failed to create listing database tables".into(),
                )),
            }
        }

        async fn retrieve(id: Self::Id, pool: &Database) -> Result<Self, Error> {
            Listing::fetch(&pool.0, id)
                .await?
                .ok_or(Error::NotFound("listing"))
        }
    }
}

mod control {
    use axum::{
        Json, Router,
        extract::{Path, Query, State},
        http::StatusCode,
        routing::{get, post},
    };
    use chrono::Days;

    use crate::{
        appstate::AppState,
        availability::{self, DateRange},
        controller::{Payload, RouteProvider, auth::Actor},
        error::Error,
        model::database::DatabaseProvider,
        plugins::{bookings::Booking, users::Role},
    };

    use super::{
        Listing, ListingID, ListingUpdate, NewListing,
        view::{AvailabilityQuery, AvailabilityView, CheckAvailability, CheckAvailabilityView},
    };

    const DEFAULT_WINDOW_DAYS: u64 = 60;
    const MAX_WINDOW_DAYS: i64 = 366;

    impl RouteProvider for Listing {
        fn provide_routes(router: Router<AppState>) -> Router<AppState> {
            router
                .route("/listings", post(Listing::create_request))
                .route("/listings/{id}", get(Listing::show).put(Listing::update_request))
                .route("/listings/{id}/availability", get(Listing::availability))
                .route(
                    "/listings/{id}/check-availability",
                    post(Listing::check_availability),
                )
        }
    }

    impl Listing {
        pub async fn create_request(
            actor: Actor,
            State(state): State<AppState>,
            Payload(payload): Payload<NewListing>,
        ) -> Result<(StatusCode, Json<Listing>), Error> {
            actor.require(Role::Host)?;
            let listing = Listing::create(&state.pool, actor.user_id, payload).await?;
            Ok((StatusCode::CREATED, Json(listing)))
        }

        pub async fn show(
            State(state): State<AppState>,
            Path(id): Path<i64>,
        ) -> Result<Json<Listing>, Error> {
            Ok(Json(Listing::retrieve(ListingID::from(id), &state.pool).await?))
        }

        pub async fn update_request(
            actor: Actor,
            State(state): State<AppState>,
            Path(id): Path<i64>,
            Payload(payload): Payload<ListingUpdate>,
        ) -> Result<Json<Listing>, Error> {
            let listing = Listing::retrieve(ListingID::from(id), &state.pool).await?;
            if !(actor.is_admin() || (actor.role == Role::Host && actor.user_id == listing.host_id)) {
                tracing::warn!(target: "listings.update", listing_id = id, user_id = %actor.user_id, reason = "not_owner", "listing edit rejected");
                return Err(Error::NotAuthorized(
                    "only the listing's host can edit it".into(),
                ));
            }
            let updated = Listing::apply_update(&state.pool, listing.id, payload).await?;
            tracing::info!(target: "listings.update", listing_id = id, available = updated.available, "listing updated");
            Ok(Json(updated))
        }

        pub async fn availability(
            State(state): State<AppState>,
            Path(id): Path<i64>,
            Query(query): Query<AvailabilityQuery>,
        ) -> Result<Json<AvailabilityView>, Error> {
            let listing = Listing::retrieve(ListingID::from(id), &state.pool).await?;
            let from = query.from.unwrap_or_else(|| state.clock.today());
            let to = match query.to {
                Some(to) => to,
                None => from
                    .checked_add_days(Days::new(DEFAULT_WINDOW_DAYS))
                    .ok_or_else(|| Error::InvalidRequest("window is out of range".into()))?,
            };
            let window = DateRange::new(from, to)
                .map_err(|_| Error::InvalidRequest("`to` must be after `from`".into()))?;
            if window.nights() > MAX_WINDOW_DAYS {
                return Err(Error::InvalidRequest(format!(
                    "availability windows are limited to {MAX_WINDOW_DAYS} days"
                )));
            }
            let bookings = Booking::holding_for_listing(&state.pool.0, listing.id).await?;
            let free_days = availability::free_days(listing.id, window, &bookings);
            Ok(Json(AvailabilityView::new(listing, window, &bookings, free_days)))
        }

        pub async fn check_availability(
            State(state): State<AppState>,
            Path(id): Path<i64>,
            Payload(payload): Payload<CheckAvailability>,
        ) -> Result<Json<CheckAvailabilityView>, Error> {
            let listing = Listing::retrieve(ListingID::from(id), &state.pool).await?;
            if !listing.available {
                return Ok(Json(CheckAvailabilityView::unbookable()));
            }
            let bookings = Booking::holding_for_listing(&state.pool.0, listing.id).await?;
            let available = state.calculator().is_range_available(
                listing.id,
                payload.start_date,
                payload.end_date,
                &bookings,
            )?;
            let range = DateRange::new(payload.start_date, payload.end_date)?;
            let conflicting: Vec<&Booking> =
                availability::conflicts(listing.id, range, &bookings).collect();
            Ok(Json(CheckAvailabilityView::new(available, &conflicting)))
        }
    }
}

mod view {
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};

    use crate::{
        availability::DateRange,
        plugins::bookings::{Booking, view::CalendarEntry},
    };

    use super::Listing;

    #[derive(Deserialize, Debug)]
    pub struct AvailabilityQuery {
        pub from: Option<NaiveDate>,
        pub to: Option<NaiveDate>,
    }

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct CheckAvailability {
        pub start_date: NaiveDate,
        pub end_date: NaiveDate,
    }

    #[derive(Serialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct AvailabilityView {
        pub available: bool,
        pub listing: Listing,
        pub window: DateRange,
        pub bookings: Vec<CalendarEntry>,
        pub free_days: Vec<NaiveDate>,
    }

    impl AvailabilityView {
        pub fn new(
            listing: Listing,
            window: DateRange,
            bookings: &[Booking],
            free_days: Vec<NaiveDate>,
        ) -> Self {
            Self {
                available: listing.available,
                listing,
                window,
                bookings: bookings.iter().map(CalendarEntry::from).collect(),
                free_days,
            }
        }
    }

    #[derive(Serialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct CheckAvailabilityView {
        pub available: bool,
        pub message: &'static str,
        pub conflicting_bookings: Vec<CalendarEntry>,
    }

    impl CheckAvailabilityView {
        pub fn new(available: bool, conflicting: &[&Booking]) -> Self {
            Self {
                available,
                message: if available {
                    "Dates are available"
                } else {
                    "Dates are not available"
                },
                conflicting_bookings: conflicting.iter().map(|b| CalendarEntry::from(*b)).collect(),
            }
        }

        pub fn unbookable() -> Self {
            Self {
                available: false,
                message: "This property is not available for booking",
                conflicting_bookings: vec![],
            }
        }
    }
}
