//! Connection middleware

pub mod rate_limit;
