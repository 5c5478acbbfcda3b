use crate::config::SkywatchConfig;
use crate::detect::engine::ScanEngine;
use crate::storage::Pool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub config: Arc<SkywatchConfig>,
    pub engine: ScanEngine,
}

impl AppState {
    pub fn new(pool: Pool, config: Arc<SkywatchConfig>) -> Self {
        let engine = ScanEngine::new(pool.clone(), config.clone());
        Self { pool, config, engine }
    }
}
