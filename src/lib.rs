pub mod cancellation;
pub mod config;
pub mod coordinator;
pub mod emitter;
pub mod error;
pub mod event;
pub mod metrics;
pub mod supervisor;
pub mod synthesis;

// get timestamp in milliseconds
pub fn get_timestamp() -> u64 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as u64
}
