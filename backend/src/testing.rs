use std::{path::PathBuf, sync::Mutex};

use axum::{
    Router,
    body::Body,
    http::{Request, Response, header::{AUTHORIZATION, CONTENT_TYPE}},
};
use chrono::NaiveDate;

use crate::{
    appstate::AppState,
    availability::Clock,
    config::Config,
    controller::auth::Actor,
    error::Error,
    model::database::Database,
    plugins::{
        bookings::{Booking, BookingRequest},
        checkout::{Notification, Notifier},
        listings::{Listing, NewListing},
        payments::{Declined, Payment, SettlementGateway},
        users::{Role, User, UserID},
    },
};

pub fn day(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

/// A throwaway database with a host's listing ($100/night, up to 4 guests) and an account
/// of every role. "Today" is 2025-05-01.
pub struct Harness {
    pub state: AppState,
    pub host: User,
    pub other_host: User,
    pub guest: User,
    pub other_guest: User,
    pub admin: User,
    pub listing: Listing,
    file: PathBuf,
}

impl Harness {
    pub async fn new() -> Self {
        let file = std::env::temp_dir().join(format!("stayhub-test-{}.db", nanoid::nanoid!()));
        let db = Database::new_with_filename(file.to_str().unwrap())
            .await
            .unwrap()
            .initialise_all()
            .await
            .unwrap();
        let state = AppState::new(db, Config::default()).with_clock(Clock::fixed(day(2025, 5, 1)));
        let pool = &state.pool;

        let host = User::register(pool, "Hana Host", "hana@example.test", Role::Host).await.unwrap();
        let other_host = User::register(pool, "Otto Host", "otto@example.test", Role::Host).await.unwrap();
        let guest = User::register(pool, "Gus Guest", "gus@example.test", Role::Guest).await.unwrap();
        let other_guest = User::register(pool, "Olga Guest", "olga@example.test", Role::Guest).await.unwrap();
        let admin = User::register(pool, "Ada Admin", "ada@example.test", Role::Admin).await.unwrap();
        let listing = Listing::create(
            pool,
            host.id,
            NewListing {
                title: "Harbour Flat".into(),
                location: "Porto".into(),
                price: 100.0,
                max_guests: 4,
                available_from: None,
                available_to: None,
            },
        )
        .await
        .unwrap();

        Self {
            state,
            host,
            other_host,
            guest,
            other_guest,
            admin,
            listing,
            file,
        }
    }

    pub fn router(&self) -> Router {
        crate::create_router(self.state.clone())
    }

    /// Books the harness listing for two guests.
    pub async fn book(&self, guest: &User, start: NaiveDate, end: NaiveDate) -> Result<Booking, Error> {
        Booking::create(
            &self.state,
            Actor::from(guest),
            BookingRequest {
                listing_id: self.listing.id,
                start_date: start,
                end_date: end,
                guests: 2,
                message: None,
            },
        )
        .await
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let mut path = self.file.clone().into_os_string();
            path.push(suffix);
            let _ = std::fs::remove_file(path);
        }
    }
}

pub fn json_request(method: &str, uri: &str, token: Option<&str>, body: &serde_json::Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub async fn json_body(res: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub struct DecliningGateway(pub &'static str);

#[async_trait::async_trait]
impl SettlementGateway for DecliningGateway {
    async fn settle(&self, _payment: &Payment) -> Result<(), Declined> {
        Err(Declined(self.0.to_string()))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(UserID, Notification)>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(UserID, Notification)> {
        self.sent.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, recipient: UserID, notification: &Notification) {
        self.sent.lock().unwrap().push((recipient, notification.clone()));
    }
}
