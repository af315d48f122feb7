use crate::{
    error::Error,
    model::database::Database,
    plugins::{
        listings::{Listing, NewListing},
        users::{Role, User},
    },
};

const DEMO_USERS: [(&str, &str, Role); 3] = [
    ("Harper Host", "host@stayhub.test", Role::Host),
    ("Gale Guest", "guest@stayhub.test", Role::Guest),
    ("Ada Admin", "admin@stayhub.test", Role::Admin),
];

/// Inserts the demo accounts and one listing unless they already exist, then logs the
/// bearer tokens so the API can be exercised by hand.
pub async fn demo(pool: &Database) -> Result<(), Error> {
    let mut host = None;
    for (name, email, role) in DEMO_USERS {
        let user = match User::from_email(pool, email).await? {
            Some(user) => user,
            None => User::register(pool, name, email, role).await?,
        };
        tracing::info!(target: "seed", email = %user.email, role = %user.role, token = %user.api_token, "demo account");
        if user.role == Role::Host {
            host = Some(user);
        }
    }
    let Some(host) = host else {
        return Ok(());
    };

    if Listing::by_host(pool, host.id).await?.is_empty() {
        let listing = Listing::create(
            pool,
            host.id,
            NewListing {
                title: "Seaside Cottage".into(),
                location: "Porthleven, Cornwall".into(),
                price: 120.0,
                max_guests: 4,
                available_from: None,
                available_to: None,
            },
        )
        .await?;
        tracing::info!(target: "seed", listing_id = %listing.id, "demo listing");
    }
    Ok(())
}
