//! Basic call isolation example

use isolation_machines::{
    BreakerConfig, CallError, CallOptions, Command, CommandInvoker, Key, ManualClock,
    MemoryConfig, TracingMetricEvents,
};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
#[error("payment gateway unavailable")]
struct GatewayDown;

fn charge(invoker: &CommandInvoker, group: &Key, healthy: bool) -> Result<String, CallError<GatewayDown>> {
    let command = Command::new(group.clone(), "Charge", Duration::from_secs(2))?;
    invoker.invoke(&command, |_token| {
        if healthy {
            Ok("payment accepted".to_string())
        } else {
            Err(GatewayDown)
        }
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    println!("=== Call Isolation Basic Example ===\n");

    let group = Key::new("payment_api")?;
    let config = Arc::new(MemoryConfig::new());
    config.set_breaker(
        &group,
        BreakerConfig {
            minimum_operations: 3,
            threshold_percentage: 50,
            tripped_duration_millis: 5_000,
            snapshot_ttl_millis: 0,
            ..Default::default()
        },
    );
    config.set_max_concurrent(&group, 4);

    // A manual clock lets the example skip the tripped wait instantly
    let clock = Arc::new(ManualClock::new(0));
    let invoker = CommandInvoker::builder()
        .config(config.clone())
        .clock(clock.clone())
        .metric_events(Arc::new(TracingMetricEvents))
        .build();

    println!("--- Successful calls ---");
    for _ in 0..2 {
        match charge(&invoker, &group, true) {
            Ok(result) => println!("✓ {}", result),
            Err(e) => println!("✗ {}", e),
        }
    }

    println!("\n--- Triggering failures ---");
    for _ in 0..3 {
        match charge(&invoker, &group, false) {
            Ok(result) => println!("✓ {}", result),
            Err(e) => println!("✗ {}", e),
        }
    }

    println!("\n--- Calls while tripped ---");
    for _ in 0..2 {
        match charge(&invoker, &group, true) {
            Ok(result) => println!("✓ {}", result),
            Err(e) if e.is_rejection() => println!("⊘ {}", e),
            Err(e) => println!("✗ {}", e),
        }
    }

    if let Some(breaker) = invoker.breaker(&group) {
        println!("Breaker state: {}", breaker.state_name());
    }

    println!("\n--- Fallback while tripped ---");
    let command = Command::new(group.clone(), "Charge", Duration::from_secs(2))?;
    let options = CallOptions::new().with_fallback(|err: CallError<GatewayDown>| {
        println!("  fallback saw: {}", err);
        Ok("payment queued for retry".to_string())
    });
    match invoker.invoke_with(&command, options, |_| Ok("payment accepted".to_string())) {
        Ok(result) => println!("✓ {}", result),
        Err(e) => println!("✗ {} (fallbacks do not run for rejections)", e),
    }

    println!("\n--- Trial after the tripped duration ---");
    clock.advance(5_001);
    match charge(&invoker, &group, true) {
        Ok(result) => println!("✓ {}", result),
        Err(e) => println!("✗ {}", e),
    }
    if let Some(breaker) = invoker.breaker(&group) {
        println!("Breaker state: {}", breaker.state_name());
    }

    println!("\n--- Gauges ---");
    invoker.report_gauges();

    Ok(())
}
