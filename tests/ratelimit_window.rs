// tests/ratelimit_window.rs
//
// Limiter decisions driven with explicit instants.

use market_sentiment_ingest::ratelimit::{
    AdaptiveRateLimiter, Decision, DenyReason, Limit, RateLimitConfig, Role,
};
use std::net::IpAddr;
use std::time::{Duration, Instant};

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn limiter_with(f: impl FnOnce(&mut RateLimitConfig)) -> AdaptiveRateLimiter {
    let mut cfg = RateLimitConfig::default();
    f(&mut cfg);
    AdaptiveRateLimiter::new(cfg)
}

#[test]
fn five_per_minute_window() {
    let rl = limiter_with(|c| c.roles.free = Limit::per_minute(5));
    let client = ip("203.0.113.10");
    let t0 = Instant::now();

    for i in 0..5 {
        let d = rl.check_request_at(client, Role::Free, None, t0 + Duration::from_secs(i * 2));
        assert!(d.is_allowed(), "request {i} should pass");
    }
    let sixth = rl.check_request_at(client, Role::Free, None, t0 + Duration::from_secs(10));
    assert_eq!(sixth, Decision::Denied(DenyReason::OverBudget { limit: 5 }));

    // Denied requests are not recorded.
    let info = rl.get_rate_limit_info_at(client, t0 + Duration::from_secs(10));
    assert_eq!(info.requests_last_minute, 5);

    let later = rl.check_request_at(client, Role::Free, None, t0 + Duration::from_secs(61));
    assert!(later.is_allowed(), "oldest entry aged out: {later:?}");
}

#[test]
fn roles_have_separate_budgets() {
    let rl = AdaptiveRateLimiter::new(RateLimitConfig::default());
    let t0 = Instant::now();
    let count_allowed = |client: IpAddr, role: Role| {
        (0..1_200)
            .filter(|_| rl.check_request_at(client, role, None, t0).is_allowed())
            .count()
    };
    assert_eq!(count_allowed(ip("203.0.113.1"), Role::Anonymous), 30);
    assert_eq!(count_allowed(ip("203.0.113.2"), Role::Free), 50);
    assert_eq!(count_allowed(ip("203.0.113.3"), Role::Standard), 100);
    assert_eq!(count_allowed(ip("203.0.113.4"), Role::Premium), 1_000);
}

#[test]
fn allowlisted_ip_is_never_limited() {
    let rl = limiter_with(|c| c.roles.free = Limit::per_minute(1));
    let t0 = Instant::now();
    for (i, addr) in ["127.0.0.1", "10.20.30.40", "192.168.1.9"].into_iter().enumerate() {
        for n in 0..1_000u64 {
            let d = rl.check_request_at(ip(addr), Role::Free, None, t0 + Duration::from_micros(n));
            assert!(d.is_allowed(), "{addr} request {n} denied");
        }
        assert_eq!(rl.get_rate_limit_info_at(ip(addr), t0).requests_last_minute, 0, "case {i}");
    }
}

#[test]
fn denylist_beats_allowlist() {
    let rl = limiter_with(|c| c.denylist = vec!["10.0.0.0/24".parse().unwrap()]);
    let inside = ip("10.0.0.7");
    assert!(rl.is_rate_limited(inside, Role::Premium));
    let d = rl.check_request_at(inside, Role::Premium, None, Instant::now());
    assert_eq!(d, Decision::Denied(DenyReason::DenyListed));
    // Elsewhere in 10/8 the allow-list still applies.
    assert!(!rl.is_rate_limited(ip("10.0.1.7"), Role::Anonymous));

    let info = rl.get_rate_limit_info(inside);
    assert!(info.is_blacklisted);
    assert!(info.is_whitelisted);
}

#[test]
fn temporary_block_expires() {
    let rl = AdaptiveRateLimiter::new(RateLimitConfig::default());
    let client = ip("198.51.100.20");
    let t0 = Instant::now();

    let until = rl.block_temporarily_at(client, 5, t0);
    let info = rl.get_rate_limit_info_at(client, t0 + Duration::from_secs(1));
    assert!(info.is_temporarily_blocked);
    assert_eq!(info.block_until, Some(until));

    let d = rl.check_request_at(client, Role::Premium, None, t0 + Duration::from_secs(299));
    assert!(matches!(d, Decision::Denied(DenyReason::Blocked { .. })));
    assert!(rl.check_request_at(client, Role::Premium, None, t0 + Duration::from_secs(300)).is_allowed());

    let info = rl.get_rate_limit_info_at(client, t0 + Duration::from_secs(301));
    assert!(!info.is_temporarily_blocked);
    assert_eq!(info.block_until, None);
    assert_eq!(info.requests_last_minute, 1);
}

#[test]
fn block_applies_even_to_allowlisted_ips() {
    let rl = AdaptiveRateLimiter::new(RateLimitConfig::default());
    let lan = ip("192.168.0.50");
    rl.block_temporarily(lan, 1);
    assert!(rl.is_rate_limited(lan, Role::Premium));
    assert!(rl.unblock(lan));
    assert!(!rl.is_rate_limited(lan, Role::Premium));
}

#[test]
fn info_for_unknown_ip_is_empty() {
    let rl = AdaptiveRateLimiter::new(RateLimitConfig::default());
    let info = rl.get_rate_limit_info(ip("2001:db8::1"));
    assert_eq!(info.ip, "2001:db8::1");
    assert_eq!(info.requests_last_minute, 0);
    assert!(!info.is_whitelisted && !info.is_blacklisted && !info.is_temporarily_blocked);
}
