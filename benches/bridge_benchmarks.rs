use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::{json, Value};
use std::time::Duration;

use host_bridge::config::{BackpressureConfig, CircuitBreakerConfig, RateLimiterConfig};
use host_bridge::execution::{ClientId, Command, CommandDispatcher, DeterministicCommandQueue, HandlerError, Payload};
use host_bridge::resilience::{BackpressureController, CircuitBreaker, CircuitState, TokenBucketRateLimiter};

fn benchmark_command_parsing(c: &mut Criterion) {
    let line = r#"{"type":"create_node","id":"bench-1","payload":{"parent":"/obj","type":"geo"},"protocol_version":"2.1.0"}"#;
    c.bench_function("command_parse", |b| b.iter(|| Command::from_json(black_box(line))));
}

fn benchmark_queue_round_trip(c: &mut Criterion) {
    let queue = DeterministicCommandQueue::new(1024);
    let client = ClientId::new();
    c.bench_function("queue_enqueue_dequeue", |b| {
        b.iter(|| {
            queue.enqueue(Command::new("echo", "bench", Payload::new()), client);
            queue.dequeue(Duration::ZERO)
        })
    });
}

fn benchmark_admission_components(c: &mut Criterion) {
    let limiter = TokenBucketRateLimiter::new(RateLimiterConfig {
        tokens_per_second: 1e9,
        bucket_size: 1e9,
        client_tokens_per_second: 1e9,
        client_bucket_size: 1e9,
    });
    c.bench_function("rate_limiter_acquire", |b| {
        b.iter(|| limiter.acquire(black_box("client-1"), 1.0))
    });

    let breaker = CircuitBreaker::new("bench", CircuitBreakerConfig::default());
    c.bench_function("circuit_breaker_can_execute", |b| b.iter(|| breaker.can_execute()));

    let backpressure = BackpressureController::new(BackpressureConfig::default());
    c.bench_function("backpressure_evaluate", |b| {
        b.iter(|| {
            backpressure.evaluate(
                black_box(40),
                black_box(Duration::from_millis(20)),
                CircuitState::Closed,
            )
        })
    });
}

fn benchmark_dispatch(c: &mut Criterion) {
    let mut dispatcher = CommandDispatcher::with_history_size(0);
    dispatcher.register("echo", |payload: &Payload| -> Result<Value, HandlerError> {
        Ok(json!(payload))
    });
    let command = Command::new("echo", "bench", Payload::new());
    c.bench_function("dispatch_echo", |b| b.iter(|| dispatcher.dispatch(black_box(&command))));
}

criterion_group!(
    benches,
    benchmark_command_parsing,
    benchmark_queue_round_trip,
    benchmark_admission_components,
    benchmark_dispatch
);
criterion_main!(benches);
