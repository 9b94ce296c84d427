//! Wall-clock readings for the address book's reputation timestamps.

use chrono::Utc;

/// Current UTC time as whole seconds since the Unix epoch, the unit every
/// reputation field is stored in.
///
/// Code that needs a reproducible clock does not stub this function; it
/// passes an explicit timestamp to the `_at` variant of the operation
/// instead.
pub fn get_timestamp() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::get_timestamp;

    #[test]
    fn timestamps_are_in_the_unix_epoch_range() {
        let first = get_timestamp();
        let second = get_timestamp();

        // 2020-01-01 predates every build of this code.
        assert!(first > 1_577_836_800);
        assert!(second >= first);
    }
}
