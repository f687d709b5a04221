pub mod cli;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod settings;

use std::sync::Arc;

use anyhow::Result;

use crate::{
    proxy::{cache::CacheStore, origin::OriginFetcher, transform::ImageTransformer},
    settings::Settings,
};

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    if let Some(addr) = settings.metrics_listen {
        tokio::spawn(async move {
            tracing::info!(address = %addr, "metrics endpoint starting");
            if let Err(err) = crate::metrics::serve(addr).await {
                tracing::error!(error = %err, "metrics endpoint failed");
            }
        });
    }

    let cache = CacheStore::open(settings.cache_dir.clone()).await?;
    tracing::info!(cache_dir = %cache.root().display(), "image cache ready");
    let fetcher = Arc::new(OriginFetcher::new(settings.origin_timeout())?);
    let transformer = Arc::new(ImageTransformer::new());

    let app = proxy::AppContext::new(settings, cache, fetcher, transformer);
    proxy::run(app).await
}
