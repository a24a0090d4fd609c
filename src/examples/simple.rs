//! Simple example of using reqwest-egress-pool.
//!
//! Loads a free proxy list, probes it, prints the working proxies fastest
//! first and sends one request through the pool.

use reqwest_egress_pool::{
    FetchConfig, ProxyPool, ProxyPoolConfig, ResilientClient, RetryPolicy, SourceConfig,
    StaticListConfig,
};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("Initializing proxy pool...");

    let config = ProxyPoolConfig::builder()
        .source(SourceConfig::StaticList(StaticListConfig::default()))
        .canary_url("https://api.ipify.org")
        .probe_timeout(Duration::from_secs(6))
        .probe_batch_size(30)
        .build();

    let pool = ProxyPool::from_config(config);
    pool.initialize().await?;

    // Probe everything once so the listing below is complete.
    while pool.candidates().iter().any(|c| c.last_checked.is_none()) {
        pool.probe_batch(false).await;
    }

    let working = pool.working_proxies();
    for (endpoint, elapsed) in &working {
        println!("[OK] {} -> {:.2}s", endpoint, elapsed.as_secs_f64());
    }
    println!("{} working proxies", working.len());

    let client = ResilientClient::new(
        FetchConfig::builder()
            .auto_rotate(true)
            .timeout(Duration::from_secs(10))
            .retry(RetryPolicy {
                enabled: true,
                max_attempts: 3,
                min_timeout: Duration::from_millis(500),
                multiplier: 2.0,
            })
            .build(),
        Some(pool.clone()),
    );

    println!("Sending request...");
    let response = client.get("https://httpbin.org/ip").send().await?;

    println!("Status: {}", response.status());
    println!("Response: {}", response.text().await?);

    pool.shutdown();
    Ok(())
}
