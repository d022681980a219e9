//! Build metadata stamped by `build.rs`.

/// Git commit SHA the binary was built from, or "unknown".
pub const BUILD_SHA: &str = env!("FLEETD_GIT_SHA");

/// Commit timestamp (Unix epoch seconds), 0 when built outside a checkout.
pub const BUILD_TIMESTAMP: u64 = parse_timestamp(env!("FLEETD_BUILD_TIMESTAMP"));

const fn parse_timestamp(raw: &str) -> u64 {
    let bytes = raw.as_bytes();
    let mut value: u64 = 0;
    let mut i = 0;
    while i < bytes.len() {
        let digit = bytes[i];
        if digit < b'0' || digit > b'9' {
            return 0;
        }
        value = value * 10 + (digit - b'0') as u64;
        i += 1;
    }
    value
}
