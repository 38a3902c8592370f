//! Fault identifiers, grouped by the component that checks them.

pub mod source {
    /// Open change stream drops and must be re-opened.
    pub const DISCONNECT: &str = "source.disconnect";
    /// Head/retention queries fail transiently.
    pub const QUERY_FAIL: &str = "source.query_fail";
}

pub mod sink {
    /// Destination write fails with a retryable error.
    pub const WRITE_FAIL: &str = "sink.write_fail";
    /// Destination write times out after possibly applying.
    pub const WRITE_TIMEOUT: &str = "sink.write_timeout";
    /// Durability flush fails with a retryable error.
    pub const FLUSH_FAIL: &str = "sink.flush_fail";
}

pub mod store {
    pub const PUT_FAIL: &str = "store.put_fail";
    pub const GET_FAIL: &str = "store.get_fail";
    pub const TIMEOUT: &str = "store.timeout";
    pub const RENAME_FAIL: &str = "store.rename_fail";
}

pub const ALL_FAULTS: &[&str] = &[
    source::DISCONNECT,
    source::QUERY_FAIL,
    sink::WRITE_FAIL,
    sink::WRITE_TIMEOUT,
    sink::FLUSH_FAIL,
    store::PUT_FAIL,
    store::GET_FAIL,
    store::TIMEOUT,
    store::RENAME_FAIL,
];
