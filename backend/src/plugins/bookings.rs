use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

use crate::{
    availability::{DateRange, Occupancy},
    plugins::{listings::ListingID, users::UserID},
};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct BookingID(i64);

impl From<i64> for BookingID {
    fn from(raw: i64) -> Self {
        BookingID(raw)
    }
}

impl From<BookingID> for i64 {
    fn from(id: BookingID) -> Self {
        id.0
    }
}

impl std::fmt::Display for BookingID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a booking.
///
/// `pending` and `approved` hold the listing's calendar; `declined` and `cancelled` are
/// terminal and release it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Approved,
    Declined,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Approved => "approved",
            BookingStatus::Declined => "declined",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn holds_calendar(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Approved)
    }

    pub fn is_payable(&self) -> bool {
        self.holds_calendar()
    }

    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Approved) | (Pending, Declined) | (Pending, Cancelled) | (Approved, Cancelled)
        )
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a booking has been paid for. Independent of [`BookingStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BookingPaymentStatus {
    Pending,
    Paid,
    Failed,
}

#[derive(Clone, FromRow, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: BookingID,
    pub listing_id: ListingID,
    pub guest_id: UserID,
    pub host_id: UserID,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub guests: i64,
    pub total_price: f64,
    pub status: BookingStatus,
    pub payment_status: BookingPaymentStatus,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Occupancy for Booking {
    fn listing(&self) -> ListingID {
        self.listing_id
    }

    fn dates(&self) -> DateRange {
        DateRange {
            start: self.start_date,
            end: self.end_date,
        }
    }

    fn status(&self) -> BookingStatus {
        self.status
    }
}

#[derive(Clone, Deserialize, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BookingRequest {
    pub listing_id: ListingID,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub guests: i64,
    #[serde(default)]
    pub message: Option<String>,
}

pub(crate) fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

mod model {
    use chrono::Utc;
    use sqlx::{Executor, Sqlite};

    use crate::{
        availability::DateRange,
        error::Error,
        model::database::{Database, DatabaseProvider},
        plugins::{
            listings::{Listing, ListingID},
            users::UserID,
        },
    };

    use super::{Booking, BookingID, BookingPaymentStatus, BookingStatus};

    impl Booking {
        pub async fn fetch<'e, E>(exec: E, id: BookingID) -> Result<Option<Booking>, Error>
        where
            E: Executor<'e, Database = Sqlite>,
        {
            let booking = sqlx::query_as::<_, Booking>("SELECT * FROM bookings WHERE id = ?1")
                .bind(id)
                .fetch_optional(exec)
                .await?;
            Ok(booking)
        }

        /// Bookings currently holding days on the listing's calendar.
        pub async fn holding_for_listing<'e, E>(
            exec: E,
            listing: ListingID,
        ) -> Result<Vec<Booking>, Error>
        where
            E: Executor<'e, Database = Sqlite>,
        {
            let bookings = sqlx::query_as::<_, Booking>(
                "SELECT * FROM bookings
                 WHERE listing_id = ?1 AND status IN ('pending', 'approved')
                 ORDER BY start_date",
            )
            .bind(listing)
            .fetch_all(exec)
            .await?;
            Ok(bookings)
        }

        pub(super) async fn insert<'e, E>(
            exec: E,
            listing: &Listing,
            guest: UserID,
            range: DateRange,
            guests: i64,
            total_price: f64,
            message: Option<&str>,
        ) -> Result<BookingID, Error>
        where
            E: Executor<'e, Database = Sqlite>,
        {
            let now = Utc::now();
            let attempt = sqlx::query(
                "INSERT INTO bookings (
                    listing_id, guest_id, host_id, start_date, end_date, guests, total_price, status, message, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            )
            .bind(listing.id)
            .bind(guest)
            .bind(listing.host_id)
            .bind(range.start)
            .bind(range.end)
            .bind(guests)
            .bind(total_price)
            .bind(BookingStatus::Pending)
            .bind(message)
            .bind(now)
            .execute(exec)
            .await;
            match attempt {
                Ok(res) => Ok(BookingID::from(res.last_insert_rowid())),
                Err(err)
                    if Error::constraint_message(&err)
                        .is_some_and(|msg| msg.contains("booking_overlap")) =>
                {
                    Err(Error::DateRangeUnavailable {
                        start: range.start,
                        end: range.end,
                    })
                }
                Err(err) => Err(err.into()),
            }
        }

        /// Compare-and-set on the status column. `false` means the row was not in `from`.
        pub(crate) async fn set_status<'e, E>(
            exec: E,
            id: BookingID,
            from: BookingStatus,
            to: BookingStatus,
        ) -> Result<bool, Error>
        where
            E: Executor<'e, Database = Sqlite>,
        {
            let res = sqlx::query(
                "UPDATE bookings SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            )
            .bind(to)
            .bind(Utc::now())
            .bind(id)
            .bind(from)
            .execute(exec)
            .await?;
            Ok(res.rows_affected() == 1)
        }

        pub(crate) async fn set_payment_status<'e, E>(
            exec: E,
            id: BookingID,
            to: BookingPaymentStatus,
        ) -> Result<(), Error>
        where
            E: Executor<'e, Database = Sqlite>,
        {
            sqlx::query("UPDATE bookings SET payment_status = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(to)
                .bind(Utc::now())
                .bind(id)
                .execute(exec)
                .await?;
            Ok(())
        }

        pub async fn for_guest(pool: &Database, guest: UserID) -> Result<Vec<Booking>, Error> {
            let bookings = sqlx::query_as::<_, Booking>(
                "SELECT * FROM bookings WHERE guest_id = ?1 ORDER BY created_at DESC, id DESC",
            )
            .bind(guest)
            .fetch_all(&pool.0)
            .await?;
            Ok(bookings)
        }

        pub async fn for_host(pool: &Database, host: UserID) -> Result<Vec<Booking>, Error> {
            let bookings = sqlx::query_as::<_, Booking>(
                "SELECT * FROM bookings WHERE host_id = ?1 ORDER BY created_at DESC, id DESC",
            )
            .bind(host)
            .fetch_all(&pool.0)
            .await?;
            Ok(bookings)
        }
    }

    impl DatabaseProvider for Booking {
        type Id = BookingID;

        async fn initialise_table(pool: Database) -> Result<Database, Error> {
            let statements = [
                "
      CREATE TABLE if not exists bookings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        listing_id INTEGER NOT NULL REFERENCES listings(id),
        guest_id INTEGER NOT NULL REFERENCES users(id),
        host_id INTEGER NOT NULL REFERENCES users(id),
        start_date TEXT NOT NULL,
        end_date TEXT NOT NULL,
        guests INTEGER NOT NULL CHECK (guests >= 1),
        total_price REAL NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('pending', 'approved', 'declined', 'cancelled')),
        payment_status TEXT NOT NULL DEFAULT 'pending' CHECK (payment_status IN ('pending', 'paid', 'failed')),
        message TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        CHECK (end_date > start_date)
      )
      ",
                "CREATE INDEX if not exists bookings_listing_status ON bookings(listing_id, status)",
                "
      CREATE TRIGGER if not exists bookings_no_overlap
      BEFORE INSERT ON bookings
      WHEN NEW.status IN ('pending', 'approved')
      BEGIN
        SELECT RAISE(ABORT, 'booking_overlap')
        WHERE EXISTS (
          SELECT 1 FROM bookings
          WHERE listing_id = NEW.listing_id
            AND status IN ('pending', 'approved')
            AND start_date < NEW.end_date
            AND end_date > NEW.start_date
        );
      END
      ",
            ];
            for statement in statements {
                if pool.0.execute(statement).await.is_err() {
                    return Err(Error::Database(
                        "Failed to create booking database tables".into(),
                    ));
                }
            }
            Ok(pool)
        }

        async fn retrieve(id: Self::Id, pool: &Database) -> Result<Self, Error> {
            Booking::fetch(&pool.0, id)
                .await?
                .ok_or(Error::NotFound("booking"))
        }
    }
}

mod service {
    use sqlx::SqliteConnection;

    use crate::{
        appstate::AppState,
        controller::auth::Actor,
        error::Error,
        plugins::{listings::Listing, users::Role},
    };

    use super::{Booking, BookingID, BookingRequest, BookingStatus, round_cents};

    impl Booking {
        /// Creates a `pending` booking. The availability check and the insert run under
        /// the listing's lock and inside one transaction.
        pub async fn create(
            state: &AppState,
            actor: Actor,
            request: BookingRequest,
        ) -> Result<Booking, Error> {
            actor.require(Role::Guest)?;
            if request.guests < 1 {
                return Err(Error::InvalidRequest("at least one guest is required".into()));
            }
            let listing = Listing::fetch(&state.pool.0, request.listing_id)
                .await?
                .ok_or(Error::NotFound("listing"))?;
            if !listing.available {
                tracing::warn!(target: "bookings.create", listing_id = %listing.id, reason = "listing_disabled", "booking rejected");
                return Err(Error::ListingNotBookable);
            }
            if request.guests > listing.max_guests {
                return Err(Error::CapacityExceeded {
                    requested: request.guests,
                    max: listing.max_guests,
                });
            }
            let calculator = state.calculator();
            calculator.validate(request.start_date, request.end_date)?;

            let _guard = state.listing_locks.acquire(listing.id).await;
            let mut tx = state.pool.begin().await?;
            let held = Booking::holding_for_listing(&mut *tx, listing.id).await?;
            let range = match calculator.ensure_available(
                listing.id,
                request.start_date,
                request.end_date,
                &held,
            ) {
                Ok(range) => range,
                Err(err) => {
                    tracing::warn!(target: "bookings.create", listing_id = %listing.id, guest_id = %actor.user_id, start = %request.start_date, end = %request.end_date, reason = err.code(), "booking rejected");
                    return Err(err);
                }
            };
            let total_price = round_cents(range.nights() as f64 * listing.price);
            let id = Booking::insert(
                &mut *tx,
                &listing,
                actor.user_id,
                range,
                request.guests,
                total_price,
                request.message.as_deref().map(str::trim).filter(|m| !m.is_empty()),
            )
            .await?;
            let booking = Booking::fetch(&mut *tx, id)
                .await?
                .ok_or(Error::NotFound("booking"))?;
            tx.commit().await?;

            tracing::info!(
                target: "bookings.create",
                booking_id = %booking.id,
                listing_id = %booking.listing_id,
                guest_id = %booking.guest_id,
                nights = range.nights(),
                total_price = booking.total_price,
                "booking created"
            );
            Ok(booking)
        }

        pub async fn approve(state: &AppState, actor: Actor, id: BookingID) -> Result<Booking, Error> {
            Booking::transition(state, actor, id, BookingStatus::Approved).await
        }

        pub async fn decline(state: &AppState, actor: Actor, id: BookingID) -> Result<Booking, Error> {
            Booking::transition(state, actor, id, BookingStatus::Declined).await
        }

        pub async fn cancel(state: &AppState, actor: Actor, id: BookingID) -> Result<Booking, Error> {
            Booking::transition(state, actor, id, BookingStatus::Cancelled).await
        }

        async fn transition(
            state: &AppState,
            actor: Actor,
            id: BookingID,
            to: BookingStatus,
        ) -> Result<Booking, Error> {
            let _guard = state.booking_locks.acquire(id).await;
            let mut tx = state.pool.begin().await?;
            let booking = Booking::transition_in(&mut tx, actor, id, to).await?;
            tx.commit().await?;
            Ok(booking)
        }

        /// Moves a booking to `to` on an open connection. The caller owns the booking's
        /// lock and the surrounding transaction.
        pub(crate) async fn transition_in(
            conn: &mut SqliteConnection,
            actor: Actor,
            id: BookingID,
            to: BookingStatus,
        ) -> Result<Booking, Error> {
            let booking = Booking::fetch(&mut *conn, id)
                .await?
                .ok_or(Error::NotFound("booking"))?;
            if let Err(err) = authorize(&actor, &booking, to) {
                tracing::warn!(target: "bookings.transition", booking_id = %id, user_id = %actor.user_id, to = %to, reason = "not_authorized", "transition rejected");
                return Err(err);
            }
            if !booking.status.can_transition_to(to)
                || !Booking::set_status(&mut *conn, id, booking.status, to).await?
            {
                tracing::warn!(target: "bookings.transition", booking_id = %id, from = %booking.status, to = %to, reason = "invalid_transition", "transition rejected");
                return Err(Error::transition(booking.status, to));
            }
            log_transition(&booking, to, &actor);
            Booking::fetch(&mut *conn, id)
                .await?
                .ok_or(Error::NotFound("booking"))
        }
    }

    fn authorize(actor: &Actor, booking: &Booking, to: BookingStatus) -> Result<(), Error> {
        if actor.is_admin() {
            return Ok(());
        }
        match to {
            BookingStatus::Approved | BookingStatus::Declined => {
                if actor.role == Role::Host && actor.user_id == booking.host_id {
                    Ok(())
                } else {
                    Err(Error::NotAuthorized(
                        "only the listing's host can approve or decline this booking".into(),
                    ))
                }
            }
            BookingStatus::Cancelled => {
                if actor.role == Role::Guest && actor.user_id == booking.guest_id {
                    Ok(())
                } else {
                    Err(Error::NotAuthorized(
                        "only the guest who made this booking can cancel it".into(),
                    ))
                }
            }
            BookingStatus::Pending => Err(Error::transition(booking.status, to)),
        }
    }

    fn log_transition(booking: &Booking, to: BookingStatus, actor: &Actor) {
        match to {
            BookingStatus::Approved => {
                tracing::info!(target: "bookings.approve", booking_id = %booking.id, listing_id = %booking.listing_id, by = %actor.user_id, "booking approved")
            }
            BookingStatus::Declined => {
                tracing::info!(target: "bookings.decline", booking_id = %booking.id, listing_id = %booking.listing_id, by = %actor.user_id, "booking declined")
            }
            BookingStatus::Cancelled => {
                tracing::info!(target: "bookings.cancel", booking_id = %booking.id, listing_id = %booking.listing_id, from = %booking.status, by = %actor.user_id, "booking cancelled")
            }
            BookingStatus::Pending => {}
        }
    }
}

mod control {
    use axum::{
        Json, Router,
        extract::{Path, State},
        http::StatusCode,
        routing::{delete, get, post},
    };

    use crate::{
        appstate::AppState,
        controller::{Payload, RouteProvider, auth::Actor},
        error::Error,
        plugins::{listings::ListingID, users::Role},
    };

    use super::{Booking, BookingID, BookingRequest, view::CalendarEntry};

    impl RouteProvider for Booking {
        fn provide_routes(router: Router<AppState>) -> Router<AppState> {
            router
                .route("/bookings", post(Booking::create_request).get(Booking::mine))
                .route("/bookings/listing/{id}", get(Booking::calendar))
                .route("/bookings/{id}", delete(Booking::cancel_request))
                .route("/host/bookings", get(Booking::hosted))
                .route("/host/bookings/{id}/approve", post(Booking::approve_request))
                .route("/host/bookings/{id}/decline", post(Booking::decline_request))
        }
    }

    impl Booking {
        pub async fn create_request(
            actor: Actor,
            State(state): State<AppState>,
            Payload(payload): Payload<BookingRequest>,
        ) -> Result<(StatusCode, Json<Booking>), Error> {
            let booking = Booking::create(&state, actor, payload).await?;
            Ok((StatusCode::CREATED, Json(booking)))
        }

        pub async fn mine(actor: Actor, State(state): State<AppState>) -> Result<Json<Vec<Booking>>, Error> {
            Ok(Json(Booking::for_guest(&state.pool, actor.user_id).await?))
        }

        pub async fn hosted(actor: Actor, State(state): State<AppState>) -> Result<Json<Vec<Booking>>, Error> {
            actor.require(Role::Host)?;
            Ok(Json(Booking::for_host(&state.pool, actor.user_id).await?))
        }

        pub async fn calendar(
            State(state): State<AppState>,
            Path(id): Path<i64>,
        ) -> Result<Json<Vec<CalendarEntry>>, Error> {
            let bookings = Booking::holding_for_listing(&state.pool.0, ListingID::from(id)).await?;
            Ok(Json(bookings.iter().map(CalendarEntry::from).collect()))
        }

        pub async fn approve_request(
            actor: Actor,
            State(state): State<AppState>,
            Path(id): Path<i64>,
        ) -> Result<Json<Booking>, Error> {
            Ok(Json(Booking::approve(&state, actor, BookingID::from(id)).await?))
        }

        pub async fn decline_request(
            actor: Actor,
            State(state): State<AppState>,
            Path(id): Path<i64>,
        ) -> Result<Json<Booking>, Error> {
            Ok(Json(Booking::decline(&state, actor, BookingID::from(id)).await?))
        }

        pub async fn cancel_request(
            actor: Actor,
            State(state): State<AppState>,
            Path(id): Path<i64>,
        ) -> Result<Json<Booking>, Error> {
            Ok(Json(Booking::cancel(&state, actor, BookingID::from(id)).await?))
        }
    }
}

pub mod view {
    use chrono::NaiveDate;
    use serde::Serialize;

    use super::{Booking, BookingStatus};

    /// The public calendar view of a booking; carries no guest details.
    #[derive(Serialize, Debug, Clone, PartialEq, Eq)]
    #[serde(rename_all = "camelCase")]
    pub struct CalendarEntry {
        pub start_date: NaiveDate,
        pub end_date: NaiveDate,
        pub status: BookingStatus,
    }

    impl From<&Booking> for CalendarEntry {
        fn from(booking: &Booking) -> Self {
            Self {
                start_date: booking.start_date,
                end_date: booking.end_date,
                status: booking.status,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use rand::{Rng, SeedableRng, rngs::StdRng};
    use serde_json::json;
    use tower::ServiceExt;

    use crate::{
        availability::Occupancy,
        controller::auth::Actor,
        error::Error,
        model::database::DatabaseProvider,
        testing::{Harness, day, json_body, json_request},
    };

    use super::*;

    fn request(h: &Harness, start: NaiveDate, end: NaiveDate, guests: i64) -> BookingRequest {
        BookingRequest {
            listing_id: h.listing.id,
            start_date: start,
            end_date: end,
            guests,
            message: None,
        }
    }

    #[test]
    fn lifecycle_edges() {
        use BookingStatus::*;
        assert!(Pending.can_transition_to(Approved));
        assert!(Pending.can_transition_to(Declined));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Approved.can_transition_to(Cancelled));
        assert!(!Approved.can_transition_to(Declined));
        for terminal in [Declined, Cancelled] {
            assert!(!terminal.holds_calendar());
            for next in [Pending, Approved, Declined, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[tokio::test]
    async fn creates_pending_booking_with_total() {
        let h = Harness::new().await;
        let booking = h.book(&h.guest, day(2025, 7, 1), day(2025, 7, 4)).await.unwrap();
        assert_eq!(booking.status, BookingStatus::Pending);
        assert_eq!(booking.total_price, 300.0);
        assert_eq!(booking.host_id, h.host.id);
        assert_eq!(booking.guest_id, h.guest.id);
    }

    #[tokio::test]
    async fn adjacent_stays_are_accepted() {
        let h = Harness::new().await;
        h.book(&h.guest, day(2025, 6, 1), day(2025, 6, 5)).await.unwrap();
        let next = h.book(&h.other_guest, day(2025, 6, 5), day(2025, 6, 8)).await;
        assert!(next.is_ok());
    }

    #[tokio::test]
    async fn overlapping_stay_is_unavailable() {
        let h = Harness::new().await;
        h.book(&h.guest, day(2025, 6, 1), day(2025, 6, 5)).await.unwrap();
        let err = h.book(&h.other_guest, day(2025, 6, 3), day(2025, 6, 7)).await.unwrap_err();
        assert!(matches!(err, Error::DateRangeUnavailable { .. }));
    }

    #[tokio::test]
    async fn declined_booking_releases_dates() {
        let h = Harness::new().await;
        let first = h.book(&h.guest, day(2025, 6, 1), day(2025, 6, 5)).await.unwrap();
        Booking::decline(&h.state, Actor::from(&h.host), first.id).await.unwrap();
        assert!(h.book(&h.other_guest, day(2025, 6, 2), day(2025, 6, 4)).await.is_ok());
    }

    #[tokio::test]
    async fn capacity_and_guest_count_are_checked() {
        let h = Harness::new().await;
        let err = Booking::create(&h.state, Actor::from(&h.guest), request(&h, day(2025, 6, 1), day(2025, 6, 3), 5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { requested: 5, max: 4 }));
        let err = Booking::create(&h.state, Actor::from(&h.guest), request(&h, day(2025, 6, 1), day(2025, 6, 3), 0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn hosts_cannot_book() {
        let h = Harness::new().await;
        let err = Booking::create(&h.state, Actor::from(&h.host), request(&h, day(2025, 6, 1), day(2025, 6, 3), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotAuthorized(_)));
    }

    #[tokio::test]
    async fn disabled_listing_is_not_bookable() {
        let h = Harness::new().await;
        crate::plugins::listings::Listing::apply_update(
            &h.state.pool,
            h.listing.id,
            crate::plugins::listings::ListingUpdate {
                available: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let err = h.book(&h.guest, day(2025, 6, 1), day(2025, 6, 3)).await.unwrap_err();
        assert!(matches!(err, Error::ListingNotBookable));
    }

    #[tokio::test]
    async fn only_owning_host_approves() {
        let h = Harness::new().await;
        let booking = h.book(&h.guest, day(2025, 6, 1), day(2025, 6, 3)).await.unwrap();

        let err = Booking::approve(&h.state, Actor::from(&h.other_host), booking.id).await.unwrap_err();
        assert!(matches!(err, Error::NotAuthorized(_)));
        let err = Booking::approve(&h.state, Actor::from(&h.guest), booking.id).await.unwrap_err();
        assert!(matches!(err, Error::NotAuthorized(_)));

        let approved = Booking::approve(&h.state, Actor::from(&h.host), booking.id).await.unwrap();
        assert_eq!(approved.status, BookingStatus::Approved);
        let err = Booking::approve(&h.state, Actor::from(&h.host), booking.id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn only_the_booking_guest_cancels() {
        let h = Harness::new().await;
        let booking = h.book(&h.guest, day(2025, 6, 1), day(2025, 6, 3)).await.unwrap();
        let err = Booking::cancel(&h.state, Actor::from(&h.other_guest), booking.id).await.unwrap_err();
        assert!(matches!(err, Error::NotAuthorized(_)));
        Booking::approve(&h.state, Actor::from(&h.host), booking.id).await.unwrap();
        let cancelled = Booking::cancel(&h.state, Actor::from(&h.guest), booking.id).await.unwrap();
        assert_eq!(cancelled.status, BookingStatus::Cancelled);
    }

    #[tokio::test]
    async fn admin_may_override() {
        let h = Harness::new().await;
        let booking = h.book(&h.guest, day(2025, 6, 1), day(2025, 6, 3)).await.unwrap();
        let declined = Booking::decline(&h.state, Actor::from(&h.admin), booking.id).await.unwrap();
        assert_eq!(declined.status, BookingStatus::Declined);
    }

    #[tokio::test]
    async fn terminal_states_are_sticky() {
        let h = Harness::new().await;
        let declined = h.book(&h.guest, day(2025, 6, 1), day(2025, 6, 3)).await.unwrap();
        Booking::decline(&h.state, Actor::from(&h.host), declined.id).await.unwrap();
        let cancelled = h.book(&h.guest, day(2025, 6, 10), day(2025, 6, 12)).await.unwrap();
        Booking::cancel(&h.state, Actor::from(&h.guest), cancelled.id).await.unwrap();

        for (id, status) in [
            (declined.id, BookingStatus::Declined),
            (cancelled.id, BookingStatus::Cancelled),
        ] {
            let host = Actor::from(&h.host);
            let guest = Actor::from(&h.guest);
            assert!(matches!(Booking::approve(&h.state, host, id).await, Err(Error::InvalidTransition { .. })));
            assert!(matches!(Booking::decline(&h.state, host, id).await, Err(Error::InvalidTransition { .. })));
            assert!(matches!(Booking::cancel(&h.state, guest, id).await, Err(Error::InvalidTransition { .. })));
            assert_eq!(Booking::retrieve(id, &h.state.pool).await.unwrap().status, status);
        }
    }

    #[tokio::test]
    async fn datastore_rejects_overlap_without_the_lock() {
        let h = Harness::new().await;
        let range = DateRange::new(day(2025, 6, 1), day(2025, 6, 5)).unwrap();
        Booking::insert(&h.state.pool.0, &h.listing, h.guest.id, range, 1, 400.0, None)
            .await
            .unwrap();
        let inner = DateRange::new(day(2025, 6, 2), day(2025, 6, 3)).unwrap();
        let err = Booking::insert(&h.state.pool.0, &h.listing, h.other_guest.id, inner, 1, 100.0, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DateRangeUnavailable { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_overlapping_requests_admit_one() {
        let h = Harness::new().await;
        let mut tasks = Vec::new();
        for offset in 0..8u32 {
            let state = h.state.clone();
            let actor = Actor::from(&h.guest);
            let req = request(&h, day(2025, 8, 1 + offset % 3), day(2025, 8, 6), 1);
            tasks.push(tokio::spawn(async move { Booking::create(&state, actor, req).await }));
        }
        let mut admitted = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => admitted += 1,
                Err(err) => assert!(matches!(err, Error::DateRangeUnavailable { .. })),
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn random_lifecycles_never_double_book() {
        let h = Harness::new().await;
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut created: Vec<BookingID> = Vec::new();
        let guests = [&h.guest, &h.other_guest];

        for _ in 0..150 {
            match rng.random_range(0..4) {
                0 | 1 => {
                    let start = day(2025, 6, 1) + chrono::Days::new(rng.random_range(0..40));
                    let end = start + chrono::Days::new(rng.random_range(1..7));
                    let guest = guests[rng.random_range(0..guests.len())];
                    if let Ok(booking) = h.book(guest, start, end).await {
                        created.push(booking.id);
                    }
                }
                op if !created.is_empty() => {
                    let id = created[rng.random_range(0..created.len())];
                    let _ = match (op, rng.random_bool(0.5)) {
                        (2, true) => Booking::approve(&h.state, Actor::from(&h.host), id).await,
                        (2, false) => Booking::decline(&h.state, Actor::from(&h.host), id).await,
                        _ => Booking::cancel(&h.state, Actor::from(&h.admin), id).await,
                    };
                }
                _ => {}
            }

            let held = Booking::holding_for_listing(&h.state.pool.0, h.listing.id).await.unwrap();
            for (i, a) in held.iter().enumerate() {
                for b in &held[i + 1..] {
                    assert!(!a.dates().overlaps(&b.dates()), "{} overlaps {}", a.dates(), b.dates());
                }
            }
        }
        assert!(!created.is_empty());
    }

    #[tokio::test]
    async fn routes_map_errors_to_statuses() {
        let h = Harness::new().await;
        let body = json!({
            "listingId": h.listing.id,
            "startDate": "2025-06-01",
            "endDate": "2025-06-05",
            "guests": 2,
            "message": "Arriving late"
        });
        let res = h
            .router()
            .oneshot(json_request("POST", "/bookings", Some(&h.guest.api_token), &body))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        let created = json_body(res).await;
        assert_eq!(created["status"], "pending");
        assert_eq!(created["paymentStatus"], "pending");
        assert_eq!(created["message"], "Arriving late");

        let res = h
            .router()
            .oneshot(json_request("POST", "/bookings", Some(&h.other_guest.api_token), &body))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(res).await["error"], "date_range_unavailable");

        let bad = json!({ "listingId": h.listing.id, "startDate": "2025-06-05", "endDate": "2025-06-05", "guests": 1 });
        let res = h
            .router()
            .oneshot(json_request("POST", "/bookings", Some(&h.guest.api_token), &bad))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let garbled = json!({ "listingId": h.listing.id, "startDate": "June 1st", "endDate": "2025-06-05", "guests": 1 });
        let res = h
            .router()
            .oneshot(json_request("POST", "/bookings", Some(&h.guest.api_token), &garbled))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(res).await["error"], "invalid_request");

        let res = h
            .router()
            .oneshot(json_request("POST", "/bookings", None, &body))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let id = created["id"].as_i64().unwrap();
        let res = h
            .router()
            .oneshot(json_request("POST", &format!("/host/bookings/{id}/approve"), Some(&h.other_host.api_token), &json!({})))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        let res = h
            .router()
            .oneshot(json_request("POST", &format!("/host/bookings/{id}/approve"), Some(&h.host.api_token), &json!({})))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res = h
            .router()
            .oneshot(json_request("POST", &format!("/host/bookings/{id}/decline"), Some(&h.host.api_token), &json!({})))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CONFLICT);

        let res = h
            .router()
            .oneshot(json_request("DELETE", &format!("/bookings/{id}"), Some(&h.guest.api_token), &json!({})))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["status"], "cancelled");
    }

    #[tokio::test]
    async fn calendar_lists_only_held_ranges() {
        let h = Harness::new().await;
        h.book(&h.guest, day(2025, 6, 1), day(2025, 6, 3)).await.unwrap();
        let gone = h.book(&h.guest, day(2025, 6, 10), day(2025, 6, 12)).await.unwrap();
        Booking::cancel(&h.state, Actor::from(&h.guest), gone.id).await.unwrap();

        let res = h
            .router()
            .oneshot(
                Request::get(format!("/bookings/listing/{}", h.listing.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            json_body(res).await,
            json!([{ "startDate": "2025-06-01", "endDate": "2025-06-03", "status": "pending" }])
        );
    }

    #[tokio::test]
    async fn guest_and_host_lists_are_scoped() {
        let h = Harness::new().await;
        h.book(&h.guest, day(2025, 6, 1), day(2025, 6, 3)).await.unwrap();
        h.book(&h.other_guest, day(2025, 6, 5), day(2025, 6, 7)).await.unwrap();

        assert_eq!(Booking::for_guest(&h.state.pool, h.guest.id).await.unwrap().len(), 1);
        assert_eq!(Booking::for_host(&h.state.pool, h.host.id).await.unwrap().len(), 2);
        assert!(Booking::for_host(&h.state.pool, h.other_host.id).await.unwrap().is_empty());
    }
}
