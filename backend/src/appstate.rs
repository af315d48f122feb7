use std::sync::Arc;

use crate::{
    availability::{AvailabilityCalculator, Clock},
    config::Config,
    locks::KeyedLocks,
    model::database::Database,
    plugins::{
        bookings::BookingID,
        checkout::{Notifier, TracingNotifier},
        listings::ListingID,
        payments::{SettlementGateway, SimulatedGateway},
    },
};

#[derive(Clone)]
pub struct AppState {
    pub pool: Database,
    pub config: Arc<Config>,
    pub clock: Clock,
    pub listing_locks: KeyedLocks<ListingID>,
    pub booking_locks: KeyedLocks<BookingID>,
    pub gateway: Arc<dyn SettlementGateway>,
    pub notifier: Arc<dyn Notifier>,
}

impl AppState {
    pub fn new(pool: Database, config: Config) -> Self {
        AppState {
            pool,
            config: Arc::new(config),
            clock: Clock::system(),
            listing_locks: KeyedLocks::new(),
            booking_locks: KeyedLocks::new(),
            gateway: Arc::new(SimulatedGateway),
            notifier: Arc::new(TracingNotifier),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn with_gateway(mut self, gateway: Arc<dyn SettlementGateway>) -> Self {
        self.gateway = gateway;
        self
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// A calculator pinned to the clock's current day.
    pub fn calculator(&self) -> AvailabilityCalculator {
        AvailabilityCalculator::new(self.config.stay, self.clock.today())
    }
}
