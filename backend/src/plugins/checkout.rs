//! The guest-facing booking and payment flow.
//!
//! A checkout is two independent units of work: the booking is created first and paid
//! second. When payment fails the booking stays `pending` and the guest can pay it later
//! through `POST /bookings/{id}/pay`. Nothing is rolled back.

use serde::{Deserialize, Serialize};

use crate::plugins::{
    bookings::{Booking, BookingRequest},
    payments::{Payment, PaymentMethod},
    users::UserID,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Success,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
}

impl Notification {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Success,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Error,
            message: message.into(),
        }
    }
}

/// Delivers user-facing messages about a checkout.
pub trait Notifier: Send + Sync {
    fn notify(&self, recipient: UserID, notification: &Notification);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, recipient: UserID, notification: &Notification) {
        match notification.level {
            NotificationLevel::Success => {
                tracing::info!(target: "checkout.notify", user_id = %recipient, message = %notification.message, "notification")
            }
            NotificationLevel::Error => {
                tracing::warn!(target: "checkout.notify", user_id = %recipient, message = %notification.message, "notification")
            }
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    #[serde(flatten)]
    pub booking: BookingRequest,
    pub payment_method: PaymentMethod,
}

#[derive(Clone, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PayRequest {
    pub payment_method: PaymentMethod,
}

#[derive(Clone, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutOutcome {
    pub booking: Booking,
    pub payment: Payment,
    pub booking_approved: bool,
    pub notification: Notification,
    pub guest_bookings: Vec<Booking>,
}

pub struct Checkout;

mod service {
    use crate::{
        appstate::AppState,
        controller::auth::Actor,
        error::Error,
        model::database::DatabaseProvider,
        plugins::{
            bookings::{Booking, BookingID},
            payments::{Payment, PaymentMethod, PaymentReceipt},
        },
    };

    use super::{Checkout, CheckoutOutcome, CheckoutRequest, Notification};

    impl Checkout {
        pub async fn book_and_pay(
            state: &AppState,
            actor: Actor,
            request: CheckoutRequest,
        ) -> Result<CheckoutOutcome, Error> {
            let booking = match Booking::create(state, actor, request.booking).await {
                Ok(booking) => booking,
                Err(err) => {
                    state
                        .notifier
                        .notify(actor.user_id, &Notification::error(format!("Booking failed: {err}")));
                    return Err(err);
                }
            };
            tracing::info!(target: "checkout.book_and_pay", booking_id = %booking.id, guest_id = %actor.user_id, "booking created, collecting payment");
            Checkout::settle(state, actor, &booking, request.payment_method).await
        }

        pub async fn pay_existing_booking(
            state: &AppState,
            actor: Actor,
            booking_id: BookingID,
            method: PaymentMethod,
        ) -> Result<CheckoutOutcome, Error> {
            let booking = match Booking::retrieve(booking_id, &state.pool).await {
                Ok(booking) => booking,
                Err(err) => {
                    state
                        .notifier
                        .notify(actor.user_id, &Notification::error(format!("Payment failed: {err}")));
                    return Err(err);
                }
            };
            tracing::info!(target: "checkout.pay_existing", booking_id = %booking.id, guest_id = %actor.user_id, "paying existing booking");
            Checkout::settle(state, actor, &booking, method).await
        }

        async fn settle(
            state: &AppState,
            actor: Actor,
            booking: &Booking,
            method: PaymentMethod,
        ) -> Result<CheckoutOutcome, Error> {
            let receipt =
                match Payment::process(state, actor, booking.id, method, booking.total_price).await {
                    Ok(receipt) => receipt,
                    Err(err) => {
                        let message = match &err {
                            Error::PaymentProcessingFailed { .. } => format!(
                                "Payment failed: {err}. Your booking is saved and you can retry payment."
                            ),
                            _ => format!("Payment failed: {err}"),
                        };
                        state.notifier.notify(actor.user_id, &Notification::error(message));
                        return Err(err);
                    }
                };
            let PaymentReceipt {
                payment,
                booking,
                booking_approved,
                ..
            } = receipt;
            let notification = Notification::success(if booking_approved {
                "Payment successful! Your booking is confirmed."
            } else {
                "Payment successful! Your booking is awaiting host approval."
            });
            state.notifier.notify(actor.user_id, &notification);
            let guest_bookings = Checkout::guest_bookings(state, actor).await;
            Ok(CheckoutOutcome {
                booking,
                payment,
                booking_approved,
                notification,
                guest_bookings,
            })
        }

        /// The payment is already committed here, so a failed refresh must not fail the checkout.
        pub(super) async fn guest_bookings(state: &AppState, actor: Actor) -> Vec<Booking> {
            match Booking::for_guest(&state.pool, actor.user_id).await {
                Ok(bookings) => bookings,
                Err(err) => {
                    tracing::warn!(target: "checkout.refresh", guest_id = %actor.user_id, error = %err, "could not refresh guest bookings");
                    Vec::new()
                }
            }
        }
    }
}

mod control {
    use axum::{
        Json, Router,
        extract::{Path, State},
        http::StatusCode,
        routing::post,
    };

    use crate::{
        appstate::AppState,
        controller::{Payload, RouteProvider, auth::Actor},
        error::Error,
        plugins::bookings::BookingID,
    };

    use super::{Checkout, CheckoutOutcome, CheckoutRequest, PayRequest};

    impl RouteProvider for Checkout {
        fn provide_routes(router: Router<AppState>) -> Router<AppState> {
            router
                .route("/checkout", post(Checkout::checkout_request))
                .route("/bookings/{id}/pay", post(Checkout::pay_request))
        }
    }

    impl Checkout {
        pub async fn checkout_request(
            actor: Actor,
            State(state): State<AppState>,
            Payload(payload): Payload<CheckoutRequest>,
        ) -> Result<(StatusCode, Json<CheckoutOutcome>), Error> {
            let outcome = Checkout::book_and_pay(&state, actor, payload).await?;
            Ok((StatusCode::CREATED, Json(outcome)))
        }

        pub async fn pay_request(
            actor: Actor,
            State(state): State<AppState>,
            Path(id): Path<i64>,
            Payload(payload): Payload<PayRequest>,
        ) -> Result<Json<CheckoutOutcome>, Error> {
            let outcome =
                Checkout::pay_existing_booking(&state, actor, BookingID::from(id), payload.payment_method)
                    .await?;
            Ok(Json(outcome))
        }
    }
}
