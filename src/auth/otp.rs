use rand::{rngs::OsRng, Rng};
use time::{Duration, OffsetDateTime};

/// Fixed validity window for every issued code.
pub const OTP_VALIDITY: Duration = Duration::minutes(10);

/// Returns a 6-digit code in [100000, 999999] and its absolute expiry.
/// The code is a string so the leading digit is preserved end to end.
pub fn generate() -> (String, OffsetDateTime) {
    let code: u32 = OsRng.gen_range(100_000..=999_999);
    (code.to_string(), OffsetDateTime::now_utc() + OTP_VALIDITY)
}
