// Copyright 2026 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Runtime Context
//!
//! Shared resources that live for the whole run:
//! 1. **Worker Pool**: a dedicated `rayon` pool sized by `output.workers`.
//! 2. **Connection Pool**: `r2d2` over the synchronous `postgres` client.

use log::info;
use r2d2::Pool;
use rayon::ThreadPool;
use std::sync::Arc;
use std::time::Duration;

use crate::application::orchestrator::build_worker_pool;
use crate::config::AppConfig;
use crate::domain::errors::{ArchiveError, Result};
use crate::infrastructure::postgres::connection_manager::PostgresConnectionManager;

pub struct RuntimeContext {
    pub pool: Arc<Pool<PostgresConnectionManager>>,
    pub workers: Arc<ThreadPool>,
}

impl RuntimeContext {
    pub fn init(config: &AppConfig) -> Result<Self> {
        let num_threads = config.output.workers.max(1);
        info!("Initializing worker pool with {} threads", num_threads);
        let workers = Arc::new(build_worker_pool(num_threads)?);

        info!("Initializing connection pool for {}...", config.database.redacted());
        let manager = PostgresConnectionManager::new(
            config.database.pg_config(),
            config.database.statement_timeout_secs,
        );

        // One connection per worker plus headroom for catalog reads.
        let pool_size = (num_threads + 2) as u32;
        let mut builder = Pool::builder().max_size(pool_size);
        if config.database.connect_timeout_secs > 0 {
            builder = builder.connection_timeout(Duration::from_secs(
                config.database.connect_timeout_secs.saturating_mul(3),
            ));
        }
        let pool = builder.build(manager).map_err(|e| {
            ArchiveError::transient_db(format!("Failed to create connection pool: {}", e))
        })?;

        Ok(Self {
            pool: Arc::new(pool),
            workers,
        })
    }
}
