use std::sync::Arc;

use actix_web::{middleware, web, App, HttpServer};
use log::{info, LevelFilter};
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

use seqvault::api;
use seqvault::app_state::AppState;
use seqvault::config::AppConfig;

/// File-based log4rs setup with a console fallback so startup is never
/// silent when the YAML is absent
fn init_logging(config_file: &str) {
    if log4rs::init_file(config_file, Default::default()).is_ok() {
        return;
    }
    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S)} {h({l})} [user:{X(user)(-)}] {t} - {m}{n}",
        )))
        .build();
    let config = Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(LevelFilter::Info))
        .expect("console logging config is valid");
    log4rs::init_config(config).expect("logger initializes once");
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let config = AppConfig::load().expect("Failed to load configuration");
    init_logging(&config.logging.config_file);

    let state = AppState::from_config(config).expect("Failed to initialize application state");

    if state.config.reconcile.enabled {
        Arc::clone(&state.reconcile_worker).start_background();
    } else {
        info!("Reconciliation sweeper disabled by configuration");
    }

    let host = state.config.server.host.clone();
    let port = state.config.server.port;
    let workers = state.config.server.workers;
    // the upload handler enforces the real cap itself; this only backstops
    // the built-in body extractors
    let payload_limit = state.config.server.max_payload_size as usize + 64 * 1024;

    info!("Starting server on {}:{}", host, port);
    let app_data = web::Data::new(state);
    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .app_data(app_data.clone())
            .app_data(web::PayloadConfig::default().limit(payload_limit))
            .configure(api::configure)
    })
    .workers(workers)
    .bind((host, port))?
    .run()
    .await
}
