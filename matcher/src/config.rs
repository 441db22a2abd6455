use crate::execution::types::BatchOptions;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Database connection string.
    pub database_url: String,

    /// Connection pool size. One session is held per worker for the
    /// duration of a group, so this should be >= the largest
    /// `worker_count` the deployment runs with.
    pub max_connections: u32,

    /// Batch options applied when the caller does not override them.
    pub default_options: BatchOptions,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://matcher_dev.db".to_string());

        let max_connections = std::env::var("MATCHER_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(16);

        // Optional JSON override for the default batch options, e.g.
        // MATCHER_DEFAULT_OPTIONS='{"worker_count":8,"sort_strategy":"amount_asc"}'
        let default_options = match std::env::var("MATCHER_DEFAULT_OPTIONS") {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(opts) => opts,
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring malformed MATCHER_DEFAULT_OPTIONS");
                    BatchOptions::default()
                }
            },
            Err(_) => BatchOptions::default(),
        };

        Self {
            database_url,
            max_connections,
            default_options,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::types::NegativeOrder;

    #[test]
    fn options_json_override_merges_with_defaults() {
        let opts: BatchOptions =
            serde_json::from_str(r#"{"worker_count": 8, "sort_strategy": "amount_asc"}"#).unwrap();

        assert_eq!(opts.worker_count, 8);
        assert_eq!(opts.sort_strategy, NegativeOrder::AmountAsc);
        // Untouched fields keep their defaults.
        assert_eq!(opts.max_stale_retries, 3);
        assert_eq!(opts.streaming_threshold, 10_000);
    }
}
