pub mod cache;
pub mod headers;
pub mod http;
pub mod listener;
pub mod origin;
pub mod request;

use std::sync::Arc;

use anyhow::Result;

use crate::settings::Settings;

#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub origin: Arc<dyn origin::Origin>,
    pub cache: Option<cache::HttpCache>,
}

impl AppContext {
    pub fn new(
        settings: Arc<Settings>,
        origin: Arc<dyn origin::Origin>,
        cache: Option<cache::HttpCache>,
    ) -> Self {
        Self {
            settings,
            origin,
            cache,
        }
    }
}

pub async fn run(app: AppContext) -> Result<()> {
    listener::start_listener(app).await
}
