use crate::models::RateLimitRule;

/// Start of the fixed window containing `timestamp` for the given window size.
pub fn window_start(timestamp: i64, window_size_seconds: u64) -> i64 {
    let window = window_size_seconds as i64;
    if window <= 0 {
        return timestamp;
    }
    (timestamp / window) * window
}

/// Counter key for a (rule, ip, window_start) triple.
pub fn format_counter_key(rule: RateLimitRule, ip: &str, window_start: i64) -> String {
    format!("{}:{}:{}", rule.as_str(), ip, window_start)
}

/// Parse a counter key back into its (rule, ip, window_start) parts.
///
/// Returns `None` for malformed keys so cleanup can discard them silently.
pub fn parse_counter_key(key: &str) -> Option<(RateLimitRule, String, i64)> {
    let (rule_str, rest) = key.split_once(':')?;
    let (ip, window_str) = rest.rsplit_once(':')?;
    let rule = RateLimitRule::parse(rule_str)?;
    let window_start = window_str.parse().ok()?;
    Some((rule, ip.to_string(), window_start))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_start_is_floored() {
        assert_eq!(window_start(1_000_000_123, 60), 1_000_000_080);
        assert_eq!(window_start(1_000_000_080, 60), 1_000_000_080);
        assert_eq!(window_start(299, 300), 0);
        assert_eq!(window_start(300, 300), 300);
    }

    #[test]
    fn test_counter_key_round_trip() {
        let key = format_counter_key(RateLimitRule::LoginAttempts, "10.0.0.1", 1200);
        assert_eq!(key, "login_attempts:10.0.0.1:1200");
        let (rule, ip, start) = parse_counter_key(&key).unwrap();
        assert_eq!(rule, RateLimitRule::LoginAttempts);
        assert_eq!(ip, "10.0.0.1");
        assert_eq!(start, 1200);
    }

    #[test]
    fn test_counter_key_survives_ipv6_colons() {
        let key = format_counter_key(RateLimitRule::ApiRequests, "2001:db8::1", 600);
        let (rule, ip, start) = parse_counter_key(&key).unwrap();
        assert_eq!(rule, RateLimitRule::ApiRequests);
        assert_eq!(ip, "2001:db8::1");
        assert_eq!(start, 600);
    }

    #[test]
    fn test_malformed_keys_are_rejected() {
        assert!(parse_counter_key("garbage").is_none());
        assert!(parse_counter_key("unknown_rule:1.2.3.4:600").is_none());
        assert!(parse_counter_key("api_requests:1.2.3.4:not_a_number").is_none());
    }
}
