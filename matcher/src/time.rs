/// Current wall-clock time as epoch milliseconds.
///
/// All persisted timestamps (`create_time`, `last_update`, `match_time`,
/// batch lifecycle times) use this representation.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
