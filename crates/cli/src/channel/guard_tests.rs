// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[tokio::test(start_paused = true)]
async fn per_chat_spacing_is_enforced() {
    let limiter = RateLimiter::new();

    let started = Instant::now();
    drop(limiter.acquire(7).await);
    drop(limiter.acquire(7).await);
    assert!(Instant::now() - started >= Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn different_chats_do_not_block_each_other() {
    let limiter = RateLimiter::new();
    let started = Instant::now();
    drop(limiter.acquire(1).await);
    drop(limiter.acquire(2).await);
    assert_eq!(Instant::now() - started, Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn backoff_delays_next_send() {
    let limiter = RateLimiter::new();
    drop(limiter.acquire(7).await);
    limiter.backoff(7, Duration::from_secs(10));

    let started = Instant::now();
    drop(limiter.acquire(7).await);
    assert!(Instant::now() - started >= Duration::from_secs(9));
}

#[tokio::test(start_paused = true)]
async fn breaker_trips_after_three_failures() {
    let breaker = CircuitBreaker::new();
    assert_eq!(breaker.state(), CircuitState::Closed);

    breaker.on_failure();
    breaker.on_failure();
    assert!(breaker.allow(), "two failures keep the circuit closed");
    breaker.on_failure();
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(!breaker.allow(), "open circuit fails fast");
}

#[tokio::test(start_paused = true)]
async fn breaker_allows_single_probe_after_window() {
    let breaker = CircuitBreaker::new();
    for _ in 0..3 {
        breaker.on_failure();
    }
    tokio::time::advance(Duration::from_secs(31)).await;

    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    assert!(breaker.allow(), "first caller gets the probe");
    assert!(!breaker.allow(), "second caller waits for the probe's outcome");

    breaker.on_success();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert!(breaker.allow());
}

#[tokio::test(start_paused = true)]
async fn failed_probe_reopens() {
    let breaker = CircuitBreaker::new();
    for _ in 0..3 {
        breaker.on_failure();
    }
    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(breaker.allow());
    breaker.on_failure();
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(!breaker.allow());
}

#[tokio::test(start_paused = true)]
async fn inbound_window_admits_then_warns_then_drops() {
    let window = InboundWindow::new();
    let session = Uuid::new_v4();

    for _ in 0..20 {
        assert_eq!(window.admit(session), Admission::Allowed);
    }
    assert_eq!(window.admit(session), Admission::RejectedWarn);
    assert_eq!(window.admit(session), Admission::RejectedSilent);

    // A fresh minute resets the budget.
    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(window.admit(session), Admission::Allowed);
}

#[tokio::test(start_paused = true)]
async fn inbound_window_is_per_session() {
    let window = InboundWindow::new();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    for _ in 0..21 {
        window.admit(a);
    }
    assert_eq!(window.admit(b), Admission::Allowed);
}
