use std::time::{Duration, SystemTime, SystemTimeError};

/// Get the time since the Unix Epoch as a `Duration`.
///
/// Used to enforce `max_execution_time`/`max_wait_for_cancellation`.
///
/// This can fail, since there's no simple way of getting system time in a
/// cross-platform way without encountering clock skew (e.g. getting
/// monotonic times). Unlikely to matter for the short-lived sandboxes this
/// crate runs, but the failure mode is nevertheless exposed to callers.
pub(crate) fn get_dur_since_epoch() -> std::result::Result<Duration, SystemTimeError> {
    SystemTime::now().duration_since(SystemTime::UNIX_EPOCH)
}

pub(crate) fn get_os_page_size() -> usize {
    page_size::get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_nonzero() {
        assert!(get_os_page_size() > 0);
    }

    #[test]
    fn dur_since_epoch_is_positive() {
        let dur = get_dur_since_epoch().unwrap();
        assert!(dur.as_secs() > 0);
    }
}
