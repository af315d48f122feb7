use axum::{Router, extract::FromRequest};

use crate::{appstate::AppState, error::Error};

pub mod auth;

pub trait Routes {
    fn add_routes<T: RouteProvider>(self) -> Self;
}

pub trait RouteProvider {
    fn provide_routes(router: Router<AppState>) -> Router<AppState>;
}

impl Routes for Router<AppState> {
    fn add_routes<T: RouteProvider>(self) -> Self {
        T::provide_routes(self)
    }
}

/// JSON request body whose rejections answer in the service's error shape.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(Error))]
pub struct Payload<T>(pub T);
