use std::sync::Arc;

use tracing::{error, info};

use patchbay::runtime::Controller;
use patchbay::server;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let controller = Arc::new(Controller::new());
    let app = server::router(controller);

    let listener = match tokio::net::TcpListener::bind("0.0.0.0:7071").await {
        Ok(listener) => listener,
        Err(err) => {
            error!("cannot bind 0.0.0.0:7071: {err}");
            std::process::exit(1);
        }
    };

    info!("serving on 7071");
    if let Err(err) = axum::serve(listener, app).await {
        error!("server stopped: {err}");
        std::process::exit(1);
    }
}
