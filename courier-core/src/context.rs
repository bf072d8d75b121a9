use std::sync::Arc;

use crate::config::Config;
use crate::db::{create_pool, DbPool};
use crate::store::{PgStore, Stores};

#[derive(Clone)]
pub struct CourierContext {
    pub config: Arc<Config>,
    pub db_pool: Arc<DbPool>,
    pub stores: Stores,
}

impl CourierContext {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let db_pool = create_pool(&config.database).await?;
        let stores = Stores::from_shared(Arc::new(PgStore::new(db_pool.clone())));

        Ok(CourierContext {
            config: Arc::new(config),
            db_pool,
            stores,
        })
    }
}
