pub mod cancel;
pub mod clock;

/// Render an elapsed wall-clock span as `Nd HH:MM:SS.mmm` for session and
/// shutdown logs.
pub fn format_elapsed(elapsed: std::time::Duration) -> String {
    let total = chrono::Duration::milliseconds(elapsed.as_millis().min(i64::MAX as u128) as i64);
    format!(
        "{}d {:0>2}:{:0>2}:{:0>2}.{:0>3}",
        total.num_days(),
        total.num_hours() % 24,
        total.num_minutes() % 60,
        total.num_seconds() % 60,
        total.num_milliseconds() % 1000
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_elapsed() {
        let elapsed = std::time::Duration::from_millis(90_061_001);
        assert_eq!(format_elapsed(elapsed), "1d 01:01:01.001");
        assert_eq!(
            format_elapsed(std::time::Duration::from_millis(61_200)),
            "0d 00:01:01.200"
        );
    }
}
