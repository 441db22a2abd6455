use sqlx::AnyPool;

pub async fn migrate(pool: &AnyPool) -> anyhow::Result<()> {
    // Blue lines: the pool of outstanding positive invoice lines. Only
    // `remaining` and `last_update` are ever mutated, and only by the
    // engine's commit path.
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS blue_lines (
  line_id BIGINT PRIMARY KEY,
  ticket_id TEXT NOT NULL,
  tax_rate SMALLINT NOT NULL,
  buyer_id INT NOT NULL,
  seller_id INT NOT NULL,
  product_name TEXT NOT NULL DEFAULT '',
  original_amount DECIMAL(15,2) NOT NULL,
  remaining DECIMAL(15,2) NOT NULL,
  batch_id TEXT,
  create_time BIGINT NOT NULL,
  last_update BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    // Match records are append-only within a batch; reversal is a new
    // record with status 'reversed', never an in-place delete.
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS match_records (
  match_id TEXT PRIMARY KEY,
  batch_id TEXT NOT NULL,
  negative_invoice_id TEXT NOT NULL,
  blue_line_id BIGINT NOT NULL,
  amount_used DECIMAL(15,2) NOT NULL,
  match_time BIGINT NOT NULL,
  status TEXT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS batch_metadata (
  batch_id TEXT PRIMARY KEY,
  table_name TEXT NOT NULL DEFAULT 'blue_lines',
  total_lines BIGINT NOT NULL,
  inserted_lines BIGINT NOT NULL DEFAULT 0,
  status TEXT NOT NULL,
  start_time BIGINT NOT NULL,
  end_time BIGINT,
  resumed_at BIGINT,
  resumed_from BIGINT,
  error_message TEXT
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS test_results (
  test_id TEXT PRIMARY KEY,
  batch_id TEXT NOT NULL,
  total_negatives BIGINT NOT NULL,
  success_count BIGINT NOT NULL,
  failed_count BIGINT NOT NULL,
  total_amount DECIMAL(15,2) NOT NULL,
  matched_amount DECIMAL(15,2) NOT NULL,
  execution_time_ms BIGINT NOT NULL,
  fragment_created BIGINT NOT NULL,
  test_time BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    // Compound partial index: keeps the candidate working set
    // proportional to active balance rather than total history.
    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_blue_lines_key_active
           ON blue_lines(tax_rate, buyer_id, seller_id) WHERE remaining > 0;"#,
    )
    .execute(pool)
    .await?;

    // Variant extended by `remaining` for index-ordered scans.
    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_blue_lines_key_remaining
           ON blue_lines(tax_rate, buyer_id, seller_id, remaining) WHERE remaining > 0;"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE UNIQUE INDEX IF NOT EXISTS uq_match_records_batch_negative_line
           ON match_records(batch_id, negative_invoice_id, blue_line_id);"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_match_records_batch
           ON match_records(batch_id);"#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
