pub mod cache;
pub mod error;
mod handler;
pub mod listener;
pub mod negotiate;
pub mod origin;
pub mod tee;
pub mod transform;

use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::routing::get;

use crate::settings::Settings;
use cache::CacheStore;
use negotiate::Negotiator;
use origin::Fetcher;
use transform::Transformer;

#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub negotiator: Arc<Negotiator>,
    pub cache: CacheStore,
    pub fetcher: Arc<dyn Fetcher>,
    pub transformer: Arc<dyn Transformer>,
}

impl AppContext {
    pub fn new(
        settings: Arc<Settings>,
        cache: CacheStore,
        fetcher: Arc<dyn Fetcher>,
        transformer: Arc<dyn Transformer>,
    ) -> Self {
        let negotiator = Arc::new(Negotiator::new(settings.origin_prefix.clone()));
        Self {
            settings,
            negotiator,
            cache,
            fetcher,
            transformer,
        }
    }
}

pub fn router(app: AppContext) -> Router {
    Router::new()
        .route("/", get(handler::health))
        .route("/img", get(handler::demo_page))
        .route("/img/{signature}/{dims}/{*url}", get(handler::serve_image))
        .with_state(app)
}

pub async fn run(app: AppContext) -> Result<()> {
    listener::start_listener(app).await
}
