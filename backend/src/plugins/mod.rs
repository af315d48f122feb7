pub mod bookings;
pub mod checkout;
pub mod listings;
pub mod payments;
pub mod users;
