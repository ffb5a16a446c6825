/// Sleep for the `n`th retry delay: nothing before the first attempt,
/// then `base_seconds` doubling per retry, capped at `max_seconds`.
pub async fn exponential_backoff(n: u32, base_seconds: f64, max_seconds: f64) {
    let backoff_duration_seconds = exponential_backoff_duration_seconds(n, base_seconds, max_seconds);
    if backoff_duration_seconds > 0.0 {
        tokio::time::sleep(std::time::Duration::from_secs_f64(backoff_duration_seconds)).await;
    }
}

pub fn exponential_backoff_duration_seconds(n: u32, base_seconds: f64, max_seconds: f64) -> f64 {
    if n == 0 {
        0.0
    } else {
        (base_seconds * 2f64.powi(n as i32 - 1)).min(max_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_zero_on_first_attempt() {
        assert_eq!(exponential_backoff_duration_seconds(0, 1.0, 10.0), 0.0);
    }

    #[test]
    fn backoff_doubles_from_base_and_caps() {
        assert_eq!(exponential_backoff_duration_seconds(1, 1.0, 10.0), 1.0);
        assert_eq!(exponential_backoff_duration_seconds(2, 1.0, 10.0), 2.0);
        assert_eq!(exponential_backoff_duration_seconds(3, 1.0, 10.0), 4.0);
        assert_eq!(exponential_backoff_duration_seconds(30, 1.0, 10.0), 10.0);
    }
}
