use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

use crate::plugins::{
    bookings::{Booking, BookingID},
    users::UserID,
};

/// Tolerance when comparing a paid amount against a booking total.
pub const AMOUNT_EPSILON: f64 = 0.005;

pub const CURRENCY: &str = "USD";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct PaymentID(i64);

impl From<i64> for PaymentID {
    fn from(raw: i64) -> Self {
        PaymentID(raw)
    }
}

impl std::fmt::Display for PaymentID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    ApplePay,
    GooglePay,
    Paypal,
    CreditCard,
}

impl PaymentMethod {
    pub const ALL: [PaymentMethod; 4] = [
        PaymentMethod::ApplePay,
        PaymentMethod::GooglePay,
        PaymentMethod::Paypal,
        PaymentMethod::CreditCard,
    ];
}

#[derive(Clone, FromRow, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: PaymentID,
    pub booking_id: BookingID,
    pub payer_id: UserID,
    pub amount: f64,
    pub currency: String,
    pub payment_method: PaymentMethod,
    pub status: PaymentStatus,
    pub transaction_id: String,
    pub failure_reason: Option<String>,
    pub refund_reason: Option<String>,
    pub refund_amount: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub refunded_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Deserialize, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub booking_id: BookingID,
    pub payment_method: PaymentMethod,
    pub amount: f64,
}

#[derive(Clone, Default, Deserialize, Debug)]
pub struct RefundRequest {
    /// Defaults to the full payment amount.
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Result of a successful payment: the settled payment and the booking as it stands after
/// any auto-approval.
#[derive(Clone, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PaymentReceipt {
    #[serde(flatten)]
    pub payment: Payment,
    pub booking: Booking,
    pub booking_approved: bool,
    pub auto_approved: bool,
}

/// A settlement refusal, carrying the reason shown to the payer.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct Declined(pub String);

/// Where a pending payment is settled.
#[async_trait::async_trait]
pub trait SettlementGateway: Send + Sync {
    async fn settle(&self, payment: &Payment) -> Result<(), Declined>;
}

/// Accepts every payment. There is no external processor behind this service.
#[derive(Clone, Copy, Debug, Default)]
pub struct SimulatedGateway;

#[async_trait::async_trait]
impl SettlementGateway for SimulatedGateway {
    async fn settle(&self, payment: &Payment) -> Result<(), Declined> {
        tracing::debug!(target: "payments.settle", transaction_id = %payment.transaction_id, amount = payment.amount, "simulated settlement");
        Ok(())
    }
}

const TXN_ALPHABET: [char; 36] = [
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R',
    'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

fn transaction_id() -> String {
    format!(
        "TXN_{}_{}",
        Utc::now().timestamp_millis(),
        nanoid::nanoid!(9, &TXN_ALPHABET)
    )
}

mod model {
    use chrono::Utc;
    use sqlx::{Executor, Sqlite};

    use crate::{
        error::Error,
        model::database::{Database, DatabaseProvider},
        plugins::{bookings::BookingID, users::UserID},
    };

    use super::{CURRENCY, Payment, PaymentID, PaymentMethod, PaymentStatus, transaction_id};

    impl Payment {
        pub async fn fetch<'e, E>(exec: E, id: PaymentID) -> Result<Option<Payment>, Error>
        where
            E: Executor<'e, Database = Sqlite>,
        {
            let payment = sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = ?1")
                .bind(id)
                .fetch_optional(exec)
                .await?;
            Ok(payment)
        }

        pub async fn completed_for<'e, E>(
            exec: E,
            booking: BookingID,
        ) -> Result<Option<Payment>, Error>
        where
            E: Executor<'e, Database = Sqlite>,
        {
            let payment = sqlx::query_as::<_, Payment>(
                "SELECT * FROM payments WHERE booking_id = ?1 AND status = 'completed'",
            )
            .bind(booking)
            .fetch_optional(exec)
            .await?;
            Ok(payment)
        }

        #[cfg(test)]
        pub async fn for_booking<'e, E>(exec: E, booking: BookingID) -> Result<Vec<Payment>, Error>
        where
            E: Executor<'e, Database = Sqlite>,
        {
            let payments = sqlx::query_as::<_, Payment>(
                "SELECT * FROM payments WHERE booking_id = ?1 ORDER BY id",
            )
            .bind(booking)
            .fetch_all(exec)
            .await?;
            Ok(payments)
        }

        pub(super) async fn insert_pending<'e, E>(
            exec: E,
            booking: BookingID,
            payer: UserID,
            method: PaymentMethod,
            amount: f64,
        ) -> Result<PaymentID, Error>
        where
            E: Executor<'e, Database = Sqlite>,
        {
            let now = Utc::now();
            let res = sqlx::query(
                "INSERT INTO payments (
                    booking_id, payer_id, amount, currency, payment_method, status, transaction_id, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            )
            .bind(booking)
            .bind(payer)
            .bind(amount)
            .bind(CURRENCY)
            .bind(method)
            .bind(PaymentStatus::Pending)
            .bind(transaction_id())
            .bind(now)
            .execute(exec)
            .await?;
            Ok(PaymentID::from(res.last_insert_rowid()))
        }

        /// Compare-and-set on the status column. `false` means the row was not in `from`.
        pub(super) async fn set_status<'e, E>(
            exec: E,
            id: PaymentID,
            from: PaymentStatus,
            to: PaymentStatus,
            failure_reason: Option<&str>,
        ) -> Result<bool, Error>
        where
            E: Executor<'e, Database = Sqlite>,
        {
            let res = sqlx::query(
                "UPDATE payments SET status = ?1, failure_reason = COALESCE(?2, failure_reason), updated_at = ?3
                 WHERE id = ?4 AND status = ?5",
            )
            .bind(to)
            .bind(failure_reason)
            .bind(Utc::now())
            .bind(id)
            .bind(from)
            .execute(exec)
            .await?;
            Ok(res.rows_affected() == 1)
        }

        /// `pending -> completed`. A second completed payment for the booking trips the
        /// `payments_one_completed` index and surfaces as [`Error::AlreadyPaid`].
        pub(super) async fn mark_completed<'e, E>(
            exec: E,
            id: PaymentID,
            booking: BookingID,
        ) -> Result<bool, Error>
        where
            E: Executor<'e, Database = Sqlite>,
        {
            let attempt = sqlx::query(
                "UPDATE payments SET status = 'completed', updated_at = ?1 WHERE id = ?2 AND status = 'pending'",
            )
            .bind(Utc::now())
            .bind(id)
            .execute(exec)
            .await;
            match attempt {
                Ok(res) => Ok(res.rows_affected() == 1),
                Err(err) if Error::is_unique_violation(&err) => Err(Error::AlreadyPaid(booking.into())),
                Err(err) => Err(err.into()),
            }
        }

        pub(super) async fn mark_refunded<'e, E>(
            exec: E,
            id: PaymentID,
            amount: f64,
            reason: Option<&str>,
        ) -> Result<bool, Error>
        where
            E: Executor<'e, Database = Sqlite>,
        {
            let now = Utc::now();
            let res = sqlx::query(
                "UPDATE payments SET status = 'refunded', refund_amount = ?1, refund_reason = ?2, refunded_at = ?3, updated_at = ?3
                 WHERE id = ?4 AND status = 'completed'",
            )
            .bind(amount)
            .bind(reason)
            .bind(now)
            .bind(id)
            .execute(exec)
            .await?;
            Ok(res.rows_affected() == 1)
        }

        pub async fn paid_by(pool: &Database, payer: UserID) -> Result<Vec<Payment>, Error> {
            let payments = sqlx::query_as::<_, Payment>(
                "SELECT * FROM payments WHERE payer_id = ?1 ORDER BY created_at DESC, id DESC LIMIT 100",
            )
            .bind(payer)
            .fetch_all(&pool.0)
            .await?;
            Ok(payments)
        }

        pub async fn received_by(pool: &Database, host: UserID) -> Result<Vec<Payment>, Error> {
            let payments = sqlx::query_as::<_, Payment>(
                "SELECT p.* FROM payments p JOIN bookings b ON b.id = p.booking_id
                 WHERE b.host_id = ?1 ORDER BY p.created_at DESC, p.id DESC LIMIT 100",
            )
            .bind(host)
            .fetch_all(&pool.0)
            .await?;
            Ok(payments)
        }

        pub async fn recent(pool: &Database) -> Result<Vec<Payment>, Error> {
            let payments = sqlx::query_as::<_, Payment>(
                "SELECT * FROM payments ORDER BY created_at DESC, id DESC LIMIT 100",
            )
            .fetch_all(&pool.0)
            .await?;
            Ok(payments)
        }
    }

    impl DatabaseProvider for Payment {
        type Id = PaymentID;

        async fn initialise_table(pool: Database) -> Result<Database, Error> {
            let statements = [
                "
      CREATE TABLE if not exists payments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        booking_id INTEGER NOT NULL REFERENCES bookings(id),
        payer_id INTEGER NOT NULL REFERENCES users(id),
        amount REAL NOT NULL,
        currency TEXT NOT NULL,
        payment_method TEXT NOT NULL CHECK (payment_method IN ('apple_pay', 'google_pay', 'paypal', 'credit_card')),
        status TEXT NOT NULL CHECK (status IN ('pending', 'completed', 'failed', 'refunded')),
        transaction_id TEXT NOT NULL UNIQUE,
        failure_reason TEXT,
        refund_reason TEXT,
        refund_amount REAL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        refunded_at TEXT
      )
      ",
                "CREATE UNIQUE INDEX if not exists payments_one_completed ON payments(booking_id) WHERE status = 'completed'",
            ];
            for statement in statements {
                if pool.0.execute(statement).await.is_err() {
                    return Err(Error::Database(
                        "Failed to create payment database tables".into(),
                    ));
                }
            }
            Ok(pool)
        }

        async fn retrieve(id: Self::Id, pool: &Database) -> Result<Self, Error> {
            Payment::fetch(&pool.0, id)
                .await?
                .ok_or(Error::NotFound("payment"))
        }
    }
}

mod service {
    use crate::{
        appstate::AppState,
        controller::auth::Actor,
        error::Error,
        model::database::DatabaseProvider,
        plugins::{
            bookings::{Booking, BookingID, BookingPaymentStatus, BookingStatus, round_cents},
            users::Role,
        },
    };

    use super::{
        AMOUNT_EPSILON, Payment, PaymentID, PaymentMethod, PaymentReceipt, PaymentStatus,
        RefundRequest,
    };

    impl Payment {
        /// Charges a booking its total and, when configured, approves it on success.
        ///
        /// Everything happens under the booking's lock. The pending payment row is
        /// committed before settlement so a failed attempt keeps its audit trail.
        pub async fn process(
            state: &AppState,
            actor: Actor,
            booking_id: BookingID,
            method: PaymentMethod,
            amount: f64,
        ) -> Result<PaymentReceipt, Error> {
            actor.require(Role::Guest)?;
            if !amount.is_finite() || amount <= 0.0 {
                return Err(Error::InvalidRequest("amount must be a positive number".into()));
            }

            let _guard = state.booking_locks.acquire(booking_id).await;

            let mut tx = state.pool.begin().await?;
            let booking = Booking::fetch(&mut *tx, booking_id)
                .await?
                .ok_or(Error::NotFound("booking"))?;
            if booking.guest_id != actor.user_id {
                return Err(Error::NotAuthorized(
                    "only the guest who made this booking can pay for it".into(),
                ));
            }
            if !booking.status.is_payable() {
                tracing::warn!(target: "payments.process", booking_id = %booking_id, status = %booking.status, reason = "not_payable", "payment rejected");
                return Err(Error::BookingNotPayable(booking.status.to_string()));
            }
            if Payment::completed_for(&mut *tx, booking_id).await?.is_some() {
                tracing::warn!(target: "payments.process", booking_id = %booking_id, reason = "already_paid", "payment rejected");
                return Err(Error::AlreadyPaid(booking_id.into()));
            }
            if (amount - booking.total_price).abs() > AMOUNT_EPSILON {
                tracing::warn!(target: "payments.process", booking_id = %booking_id, amount, expected = booking.total_price, reason = "amount_mismatch", "payment rejected");
                return Err(Error::AmountMismatch {
                    expected: booking.total_price,
                    received: amount,
                });
            }
            let payment_id =
                Payment::insert_pending(&mut *tx, booking_id, actor.user_id, method, booking.total_price)
                    .await?;
            let payment = Payment::fetch(&mut *tx, payment_id)
                .await?
                .ok_or(Error::NotFound("payment"))?;
            tx.commit().await?;

            if let Err(declined) = state.gateway.settle(&payment).await {
                let mut tx = state.pool.begin().await?;
                Payment::set_status(
                    &mut *tx,
                    payment_id,
                    PaymentStatus::Pending,
                    PaymentStatus::Failed,
                    Some(declined.0.as_str()),
                )
                .await?;
                Booking::set_payment_status(&mut *tx, booking_id, BookingPaymentStatus::Failed).await?;
                tx.commit().await?;
                tracing::warn!(target: "payments.process", booking_id = %booking_id, payment_id = %payment_id, reason = %declined, "settlement declined");
                return Err(Error::PaymentProcessingFailed {
                    booking_id: booking_id.into(),
                    reason: declined.0,
                });
            }

            match Payment::complete(state, payment_id, &booking).await {
                Ok(receipt) => {
                    tracing::info!(
                        target: "payments.process",
                        booking_id = %booking_id,
                        payment_id = %payment_id,
                        transaction_id = %receipt.payment.transaction_id,
                        amount = receipt.payment.amount,
                        auto_approved = receipt.auto_approved,
                        "payment completed"
                    );
                    Ok(receipt)
                }
                Err(err) => {
                    let reason = err.to_string();
                    Payment::set_status(
                        &state.pool.0,
                        payment_id,
                        PaymentStatus::Pending,
                        PaymentStatus::Failed,
                        Some(reason.as_str()),
                    )
                    .await?;
                    if let Error::AlreadyPaid(_) = err {
                        tracing::warn!(target: "payments.process", booking_id = %booking_id, payment_id = %payment_id, reason = "already_paid", "payment rejected");
                        return Err(err);
                    }
                    tracing::error!(target: "payments.process", booking_id = %booking_id, payment_id = %payment_id, error = %err, "payment completion failed");
                    Err(Error::PaymentProcessingFailed {
                        booking_id: booking_id.into(),
                        reason,
                    })
                }
            }
        }

        /// Flips a settled payment to `completed` and applies auto-approval in one
        /// transaction.
        async fn complete(
            state: &AppState,
            payment_id: PaymentID,
            booking: &Booking,
        ) -> Result<PaymentReceipt, Error> {
            let mut tx = state.pool.begin().await?;
            if !Payment::mark_completed(&mut *tx, payment_id, booking.id).await? {
                return Err(Error::transition(PaymentStatus::Pending, PaymentStatus::Completed));
            }
            Booking::set_payment_status(&mut *tx, booking.id, BookingPaymentStatus::Paid).await?;
            let mut auto_approved = false;
            let current = if state.config.auto_approve_on_payment
                && booking.status == BookingStatus::Pending
            {
                let host = Actor::new(booking.host_id, Role::Host);
                auto_approved = true;
                Booking::transition_in(&mut tx, host, booking.id, BookingStatus::Approved).await?
            } else {
                Booking::fetch(&mut *tx, booking.id)
                    .await?
                    .ok_or(Error::NotFound("booking"))?
            };
            let payment = Payment::fetch(&mut *tx, payment_id)
                .await?
                .ok_or(Error::NotFound("payment"))?;
            tx.commit().await?;
            Ok(PaymentReceipt {
                booking_approved: current.status == BookingStatus::Approved,
                payment,
                booking: current,
                auto_approved,
            })
        }

        pub async fn refund(
            state: &AppState,
            actor: Actor,
            id: PaymentID,
            request: RefundRequest,
        ) -> Result<Payment, Error> {
            let payment = Payment::retrieve(id, &state.pool).await?;
            if !(actor.is_admin() || actor.user_id == payment.payer_id) {
                return Err(Error::NotAuthorized(
                    "only the payer or an administrator can refund a payment".into(),
                ));
            }
            let amount = match request.amount {
                None => payment.amount,
                Some(amount) if !amount.is_finite() || amount <= 0.0 => {
                    return Err(Error::InvalidRequest("refund amount must be a positive number".into()));
                }
                Some(amount) if amount > payment.amount + AMOUNT_EPSILON => {
                    return Err(Error::InvalidRequest(format!(
                        "refund amount {amount:.2} exceeds the payment amount {:.2}",
                        payment.amount
                    )));
                }
                Some(amount) => round_cents(amount.min(payment.amount)),
            };
            let _guard = state.booking_locks.acquire(payment.booking_id).await;
            let mut tx = state.pool.begin().await?;
            let current = Payment::fetch(&mut *tx, id)
                .await?
                .ok_or(Error::NotFound("payment"))?;
            let reason = request.reason.as_deref().map(str::trim).filter(|r| !r.is_empty());
            if !Payment::mark_refunded(&mut *tx, id, amount, reason).await? {
                tracing::warn!(target: "payments.refund", payment_id = %id, status = %current.status, reason = "not_completed", "refund rejected");
                return Err(Error::transition(current.status, PaymentStatus::Refunded));
            }
            let refunded = Payment::fetch(&mut *tx, id)
                .await?
                .ok_or(Error::NotFound("payment"))?;
            tx.commit().await?;
            tracing::info!(target: "payments.refund", payment_id = %id, booking_id = %refunded.booking_id, amount, by = %actor.user_id, "payment refunded");
            Ok(refunded)
        }

        /// Payments visible to the caller: their own as a guest, those on their listings
        /// as a host, all as an administrator.
        pub async fn history(state: &AppState, actor: Actor) -> Result<Vec<Payment>, Error> {
            match actor.role {
                Role::Guest => Payment::paid_by(&state.pool, actor.user_id).await,
                Role::Host => Payment::received_by(&state.pool, actor.user_id).await,
                Role::Admin => Payment::recent(&state.pool).await,
            }
        }

        pub async fn visible_to(state: &AppState, actor: Actor, id: PaymentID) -> Result<Payment, Error> {
            let payment = Payment::retrieve(id, &state.pool).await?;
            if actor.is_admin() || actor.user_id == payment.payer_id {
                return Ok(payment);
            }
            let booking = Booking::retrieve(payment.booking_id, &state.pool).await?;
            if actor.user_id == booking.host_id {
                Ok(payment)
            } else {
                Err(Error::NotAuthorized("this payment belongs to another account".into()))
            }
        }
    }
}

mod control {
    use axum::{
        Json, Router,
        extract::{Path, State, rejection::JsonRejection},
        routing::{get, post},
    };

    use crate::{
        appstate::AppState,
        controller::{Payload, RouteProvider, auth::Actor},
        error::Error,
    };

    use super::{Payment, PaymentID, PaymentMethod, PaymentReceipt, PaymentRequest, RefundRequest};

    impl RouteProvider for Payment {
        fn provide_routes(router: Router<AppState>) -> Router<AppState> {
            router
                .route("/payments/process", post(Payment::process_request))
                .route("/payments/methods", get(Payment::methods))
                .route("/payments/history", get(Payment::history_request))
                .route("/payments/{id}", get(Payment::show))
                .route("/payments/{id}/refund", post(Payment::refund_request))
        }
    }

    impl Payment {
        pub async fn process_request(
            actor: Actor,
            State(state): State<AppState>,
            Payload(payload): Payload<PaymentRequest>,
        ) -> Result<Json<PaymentReceipt>, Error> {
            let receipt = Payment::process(
                &state,
                actor,
                payload.booking_id,
                payload.payment_method,
                payload.amount,
            )
            .await?;
            Ok(Json(receipt))
        }

        pub async fn methods() -> Json<[PaymentMethod; 4]> {
            Json(PaymentMethod::ALL)
        }

        pub async fn history_request(
            actor: Actor,
            State(state): State<AppState>,
        ) -> Result<Json<Vec<Payment>>, Error> {
            Ok(Json(Payment::history(&state, actor).await?))
        }

        pub async fn show(
            actor: Actor,
            State(state): State<AppState>,
            Path(id): Path<i64>,
        ) -> Result<Json<Payment>, Error> {
            Ok(Json(Payment::visible_to(&state, actor, PaymentID::from(id)).await?))
        }

        pub async fn refund_request(
            actor: Actor,
            State(state): State<AppState>,
            Path(id): Path<i64>,
            payload: Result<Option<Json<RefundRequest>>, JsonRejection>,
        ) -> Result<Json<Payment>, Error> {
            let request = payload?.map(|Json(body)| body).unwrap_or_default();
            Ok(Json(Payment::refund(&state, actor, PaymentID::from(id), request).await?))
        }
    }
}
