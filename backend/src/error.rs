use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::NaiveDate;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid date range: {0}")]
    InvalidDateRange(String),
    #[error("the selected dates {start} to {end} are not available, please choose different dates")]
    DateRangeUnavailable { start: NaiveDate, end: NaiveDate },
    #[error("{requested} guests requested but this listing allows at most {max}")]
    CapacityExceeded { requested: i64, max: i64 },
    #[error("not authorized: {0}")]
    NotAuthorized(String),
    #[error("booking cannot move from {from} to {to}")]
    InvalidTransition { from: String, to: String },
    #[error("a {0} booking cannot be paid")]
    BookingNotPayable(String),
    #[error("payment amount {received:.2} does not match the booking total {expected:.2}")]
    AmountMismatch { expected: f64, received: f64 },
    #[error("booking {0} has already been paid")]
    AlreadyPaid(i64),
    #[error("payment failed: {reason}")]
    PaymentProcessingFailed { booking_id: i64, reason: String },
    #[error("this property is not available for booking")]
    ListingNotBookable,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("missing or invalid bearer token")]
    Unauthenticated,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("failed to bind socket: {0}")]
    SocketBind(String),
    #[error("server stopped: {0}")]
    Serve(String),
}

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidDateRange(_) => "invalid_date_range",
            Error::DateRangeUnavailable { .. } => "date_range_unavailable",
            Error::CapacityExceeded { .. } => "capacity_exceeded",
            Error::NotAuthorized(_) => "not_authorized",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::BookingNotPayable(_) => "booking_not_payable",
            Error::AmountMismatch { .. } => "amount_mismatch",
            Error::AlreadyPaid(_) => "already_paid",
            Error::PaymentProcessingFailed { .. } => "payment_processing_failed",
            Error::ListingNotBookable => "listing_not_bookable",
            Error::NotFound(_) => "not_found",
            Error::Unauthenticated => "unauthenticated",
            Error::InvalidRequest(_) => "invalid_request",
            Error::Database(_) => "database",
            Error::Config(_) => "config",
            Error::SocketBind(_) => "socket_bind",
            Error::Serve(_) => "serve",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::InvalidDateRange(_)
            | Error::CapacityExceeded { .. }
            | Error::AmountMismatch { .. }
            | Error::ListingNotBookable
            | Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::DateRangeUnavailable { .. }
            | Error::InvalidTransition { .. }
            | Error::BookingNotPayable(_)
            | Error::AlreadyPaid(_) => StatusCode::CONFLICT,
            Error::NotAuthorized(_) => StatusCode::FORBIDDEN,
            Error::PaymentProcessingFailed { .. } => StatusCode::PAYMENT_REQUIRED,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Unauthenticated => StatusCode::UNAUTHORIZED,
            Error::Database(_) | Error::Config(_) | Error::SocketBind(_) | Error::Serve(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub(crate) fn transition(from: impl ToString, to: impl ToString) -> Self {
        Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// The datastore message for a constraint that carries domain meaning.
    pub(crate) fn constraint_message(err: &sqlx::Error) -> Option<String> {
        err.as_database_error().map(|db| db.message().to_string())
    }

    pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
        err.as_database_error()
            .is_some_and(|db| db.is_unique_violation())
    }
}

impl From<sqlx::Error> for Error {
    fn from(value: sqlx::Error) -> Self {
        Error::Database(format!("{:?}", value))
    }
}

impl From<JsonRejection> for Error {
    fn from(rejection: JsonRejection) -> Self {
        Error::InvalidRequest(rejection.body_text())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            tracing::error!(target: "http.error", error = %self, "request failed");
            "internal server error".to_string()
        } else {
            self.to_string()
        };
        let mut body = json!({
            "error": self.code(),
            "message": message,
        });
        if let Error::PaymentProcessingFailed { booking_id, .. } = &self {
            body["bookingId"] = json!(booking_id);
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_distinct_statuses() {
        let unavailable = Error::DateRangeUnavailable {
            start: NaiveDate::from_ymd_opt(2025, 6, 3).unwrap(),
            end: NaiveDate::from_ymd_opt(2025, 6, 7).unwrap(),
        };
        assert_eq!(unavailable.status(), StatusCode::CONFLICT);
        assert_eq!(
            Error::PaymentProcessingFailed { booking_id: 1, reason: "declined".into() }.status(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(Error::NotAuthorized("x".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(
            Error::AmountMismatch { expected: 300.0, received: 299.0 }.status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn messages_distinguish_dates_from_payment() {
        let dates = Error::DateRangeUnavailable {
            start: NaiveDate::from_ymd_opt(2025, 6, 3).unwrap(),
            end: NaiveDate::from_ymd_opt(2025, 6, 7).unwrap(),
        };
        let payment = Error::PaymentProcessingFailed { booking_id: 4, reason: "card declined".into() };
        assert!(dates.to_string().contains("not available"));
        assert!(payment.to_string().contains("card declined"));
        assert_ne!(dates.code(), payment.code());
    }

    #[tokio::test]
    async fn server_errors_hide_their_detail() {
        let res = Error::Database("no such column: secret_token in SELECT".into()).into_response();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "database");
        assert_eq!(body["message"], "internal server error");

        let serve = Error::Serve("connection reset".into());
        assert_eq!(serve.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(serve.code(), "serve");
    }
}
