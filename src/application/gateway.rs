//! Wiring of the routing engine, caches and revalidation queue for one build.

use std::sync::Arc;

use reqwest::Client;
use tracing::info;

use crate::{
    application::{error::AppError, render::RenderPipeline},
    cache::{self, CacheConfig, CacheInterceptor, ComposableCache, IncrementalCache},
    config::Settings,
    infra::{error::InfraError, manifests::BuildManifests, origin::OriginRenderer},
    queue::{HttpRevalidator, MemoryQueue, RevalidationConsumer, RevalidationDispatcher, Revalidator},
    routing::RoutingEngine,
};

/// Everything a serving process shares across requests.
#[derive(Clone)]
pub struct Gateway {
    pub engine: Arc<RoutingEngine>,
    pub incremental: Arc<IncrementalCache>,
    pub composable: Arc<ComposableCache>,
    pub interceptor: Arc<CacheInterceptor>,
    pub queue: Arc<MemoryQueue>,
    pub consumer: Arc<RevalidationConsumer>,
    pub render: Arc<dyn RenderPipeline>,
    pub config: CacheConfig,
}

impl Gateway {
    /// Production wiring: origin renderer and HTTP revalidator share one client.
    pub fn from_settings(settings: &Settings, manifests: &BuildManifests) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(concat!("isrgate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| InfraError::http_client(err.to_string()))?;

        let engine = Arc::new(RoutingEngine::new(manifests)?);
        let render: Arc<dyn RenderPipeline> = Arc::new(OriginRenderer::new(
            client.clone(),
            settings.render.origin.clone(),
            settings.render.timeout,
        ));
        let revalidator: Arc<dyn Revalidator> = Arc::new(HttpRevalidator::new(
            client,
            settings.render.origin.clone(),
            engine.prerender().preview_mode_id(),
            settings.revalidation.request_timeout,
        ));

        Ok(Self::assemble(
            engine,
            settings.cache_config(),
            render,
            revalidator,
        ))
    }

    /// Wire the caches and queue around an already compiled engine.
    pub fn assemble(
        engine: Arc<RoutingEngine>,
        config: CacheConfig,
        render: Arc<dyn RenderPipeline>,
        revalidator: Arc<dyn Revalidator>,
    ) -> Self {
        let store = cache::artifact_store(&config);
        let tags = cache::tag_index(config.tag_mode);
        let build_id = engine.build_id().to_string();

        let incremental = Arc::new(IncrementalCache::new(
            build_id.clone(),
            store.clone(),
            tags.clone(),
        ));
        let composable = Arc::new(ComposableCache::new(build_id.clone(), store, tags));

        let queue = Arc::new(MemoryQueue::new(config.queue_limit));
        let dispatcher =
            RevalidationDispatcher::new(queue.clone(), config.max_revalidate_concurrency());
        let consumer = Arc::new(RevalidationConsumer::new(
            queue.clone(),
            revalidator,
            config.consume_batch_limit,
        ));
        let interceptor = Arc::new(CacheInterceptor::new(
            engine.clone(),
            incremental.clone(),
            dispatcher,
        ));

        info!(
            build_id = %build_id,
            backend = ?config.backend,
            tag_mode = config.tag_mode.as_str(),
            partitions = config.max_revalidate_concurrency(),
            render = render.name(),
            "Gateway assembled"
        );

        Self {
            engine,
            incremental,
            composable,
            interceptor,
            queue,
            consumer,
            render,
            config,
        }
    }
}
