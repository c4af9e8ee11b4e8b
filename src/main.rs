use std::io;
use std::sync::Arc;

use actix::{Actor, Arbiter};
use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use clap::Parser;
use mockable::{Clock, DefaultClock};
use mongodb::Client;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use opensplit_sync::accounts::AccountService;
use opensplit_sync::config::Config;
use opensplit_sync::invites::InviteClaimCoordinator;
use opensplit_sync::link_requests::LinkRequestService;
use opensplit_sync::orchestrator::{SyncOrchestrator, SyncStores};
use opensplit_sync::persistence::{CacheWriter, FileCache};
use opensplit_sync::routes::{self, AppState, OrchestratorFactory, SessionRegistry};
use opensplit_sync::schemas::Session;
use opensplit_sync::stores::mongo::{
    ensure_indexes, MongoAccountStore, MongoExpenseStore, MongoGroupStore, MongoInviteStore,
    MongoLinkRequestStore,
};

#[actix_web::main]
async fn main() -> io::Result<()> {
    if let Err(e) = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .try_init()
    {
        warn!(error = %e, "tracing init failed");
    }

    let config = Config::try_parse().map_err(io::Error::other)?;
    let secret = config.session_secret().map_err(io::Error::other)?.to_owned();

    let client = Client::with_uri_str(&config.mongodb_uri)
        .await
        .map_err(io::Error::other)?;
    let db = client.database(&config.database);
    ensure_indexes(&db).await.map_err(io::Error::other)?;
    info!(database = %config.database, "connected to mongodb");

    let clock: Arc<dyn Clock> = Arc::new(DefaultClock);
    let accounts = Arc::new(MongoAccountStore::new(&db));

    // Writers live on the main arbiter so they outlive the HTTP workers and can be flushed.
    let arbiter = Arbiter::current();
    let factory: OrchestratorFactory = {
        let db = db.clone();
        let clock = Arc::clone(&clock);
        let accounts = Arc::clone(&accounts);
        let config = config.clone();
        Box::new(move |session: &Session| {
            let cache = Arc::new(FileCache::new(&config.cache_dir, &session.account_id));
            let writer = {
                let cache = cache.clone();
                let delay = config.persist_delay();
                CacheWriter::start_in_arbiter(&arbiter, move |_| CacheWriter::new(cache, delay))
            };
            let stores = SyncStores {
                groups: Arc::new(MongoGroupStore::new(&db, session.account_id.clone())),
                expenses: Arc::new(MongoExpenseStore::new(&db, session.account_id.clone())),
                accounts: accounts.clone(),
                cache,
            };
            SyncOrchestrator::new(stores, Arc::clone(&clock), config.sync_settings())
                .with_writer(writer)
        })
    };

    let state = web::Data::new(AppState {
        session_secret: secret,
        registry: SessionRegistry::new(factory),
        invites: InviteClaimCoordinator::new(
            Arc::new(MongoInviteStore::new(&db)),
            Arc::clone(&clock),
            &config.invite_base_url,
        ),
        link_requests: LinkRequestService::new(
            Arc::new(MongoLinkRequestStore::new(&db)),
            accounts.clone(),
            Arc::clone(&clock),
        ),
        accounts: AccountService::new(accounts),
    });

    info!(host = %config.bind_host, port = config.port, "starting server");
    let app_state = state.clone();
    HttpServer::new(move || {
        App::new()
            .wrap(Cors::permissive())
            .app_data(app_state.clone())
            .configure(routes::configure)
    })
    .bind((config.bind_host.as_str(), config.port))?
    .run()
    .await?;

    state.registry.flush_all().await;
    info!("server stopped");
    Ok(())
}
