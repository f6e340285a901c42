use std::sync::Arc;

use actix_web::{
    cookie::Key,
    middleware,
    web::{self, Data},
    App, HttpServer,
};
use log::info;

use vivo::{
    config::AppConfig, connect_backend, identity_middleware, routes, session_middleware, AppState,
};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = AppConfig::from_env().map_err(|e| {
        log::error!("FATAL: {}", e);
        e
    })?;

    let backend = connect_backend(&config.backend).await.map_err(|e| {
        log::error!("FATAL: backend unavailable: {}", e);
        std::io::Error::other(e)
    })?;

    let listener = backend.events().subscribe(|event| {
        info!("Auth event {} for user {}", event.kind, event.user_id);
    });

    let key = Key::from(config.session_key.as_bytes());
    let cookie_secure = config.cookie_secure;
    let bind = (config.host.clone(), config.port);
    let state = Data::new(AppState {
        backend,
        config: Arc::new(config),
    });

    info!("Starting HTTP server on http://{}:{}/", bind.0, bind.1);

    HttpServer::new(move || {
        App::new()
            // enable automatic response compression - usually register this first
            .wrap(middleware::Compress::default())
            .wrap(identity_middleware())
            .wrap(session_middleware(key.clone(), cookie_secure))
            // enable logger - always register Actix Web Logger middleware last
            .wrap(middleware::Logger::default())
            .app_data(state.clone())
            .configure(routes::configure)
            .default_service(web::to(routes::default_handler))
    })
    .bind(bind)?
    .run()
    .await?;

    listener.unsubscribe();
    info!("Server stopped");
    Ok(())
}
