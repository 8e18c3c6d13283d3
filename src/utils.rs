use std::time::{SystemTime, UNIX_EPOCH};

pub struct Utils;

impl Utils {
    pub fn unix_now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    pub fn system_time_to_unix(time: SystemTime) -> Option<i64> {
        time.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_time_to_unix() {
        let t = UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        assert_eq!(Utils::system_time_to_unix(t), Some(1_700_000_000));
    }

    #[test]
    fn test_unix_now_is_positive() {
        assert!(Utils::unix_now() > 0);
    }
}
