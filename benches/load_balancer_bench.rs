//! Provider-selection throughput under §4.1 steps 3-4: filter a
//! provider list down to the eligible set (enabled, config-valid,
//! model-gated, not blacklisted) and group the survivors by priority
//! level, ascending.
//!
//! Grounded on `dispatcher.rs`'s `select_candidates`, rebuilt here over
//! the pool's public `Provider` methods plus a plain `HashSet` standing
//! in for `Blacklist::is_blacklisted` (a live SQLite round-trip isn't
//! representative of the in-process selection cost this benchmark
//! targets). Grounded on the teacher's `load_balancer_bench.rs`
//! placeholder, which this supersedes.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use relay_gateway::provider::Provider;
use std::collections::{HashMap, HashSet};

fn make_providers(count: usize) -> Vec<Provider> {
    (0..count)
        .map(|i| Provider {
            id: i as u64,
            name: format!("provider-{i}"),
            base_url: format!("https://upstream-{i}.example.com"),
            api_key: "sk-test-key".to_string(),
            endpoint_override: None,
            enabled: true,
            priority: (i % 4) as u32,
            supported_models: vec!["claude-3-5-sonnet".to_string(), "claude-3-opus".to_string()],
            model_mapping: HashMap::new(),
            connectivity_auth_type: Default::default(),
            availability_monitor_enabled: true,
            connectivity_auto_blacklist: false,
            availability: Default::default(),
        })
        .collect()
}

fn select_candidates(providers: &[Provider], model: &str, blacklisted: &HashSet<String>) -> Vec<Vec<Provider>> {
    let eligible: Vec<Provider> = providers
        .iter()
        .filter(|p| p.enabled && p.is_config_valid() && p.is_eligible_for(model))
        .filter(|p| !blacklisted.contains(&p.name))
        .cloned()
        .collect();

    let mut levels: Vec<u32> = eligible.iter().map(|p| p.level()).collect();
    levels.sort_unstable();
    levels.dedup();

    levels
        .into_iter()
        .map(|level| eligible.iter().filter(|p| p.level() == level).cloned().collect())
        .collect()
}

fn bench_select_candidates(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_candidates");

    for &count in &[8usize, 64, 512] {
        let providers = make_providers(count);
        let blacklisted: HashSet<String> = providers
            .iter()
            .enumerate()
            .filter(|(i, _)| i % 5 == 0)
            .map(|(_, p)| p.name.clone())
            .collect();

        group.bench_function(format!("providers_{count}"), |b| {
            b.iter(|| black_box(select_candidates(black_box(&providers), "claude-3-5-sonnet", black_box(&blacklisted))))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_select_candidates);
criterion_main!(benches);
