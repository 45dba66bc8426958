// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Boot from a configuration file, run on real threads, shut down cleanly.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use kos_kernel::{boot, BalancePolicy, IrqFlags, IrqReturn, KernelConfig, TIMER_IRQ};

fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

#[test]
fn boots_from_file_and_ticks_on_its_own() {
    let dir = tempfile::tempdir().expect("tempdir");
    let panic_log = dir.path().join("panic.log");
    let doc = format!(
        r#"{{
            "irq": {{"balance_policy": "round-robin", "balance_interval_ms": 5, "nr_cpus": 2}},
            "sched": {{"timeslice_ms": 3}},
            "panic": {{"log_path": {:?}, "core_dir": {:?}, "blink": false}}
        }}"#,
        panic_log.display().to_string(),
        dir.path().display().to_string()
    );
    let mut file = tempfile::NamedTempFile::new_in(dir.path()).expect("config file");
    file.write_all(doc.as_bytes()).expect("write config");

    let config = KernelConfig::load(file.path()).expect("load");
    assert_eq!(config.irq.balance_policy, BalancePolicy::RoundRobin);
    let kernel = boot(config).expect("boot");
    assert!(kernel.timers().is_running());
    assert!(kernel.irqs().is_balancing());

    assert!(wait_until(Duration::from_secs(5), || kernel.sched().stats().ticks >= 5));
    assert!(kernel.irqs().info(TIMER_IRQ).expect("tick line").count >= 5);
    assert!(wait_until(Duration::from_secs(5), || kernel.irqs().stats().balance_runs > 0));

    let stats = kernel.stats_json().expect("stats");
    assert!(stats.contains("\"uptime_ns\""));

    kernel.shutdown();
    assert!(!kernel.timers().is_running());
    assert!(!kernel.irqs().is_balancing());
    assert!(!kernel.net().is_running());
    let ticks = kernel.sched().stats().ticks;
    thread::sleep(Duration::from_millis(20));
    assert_eq!(kernel.sched().stats().ticks, ticks);
}

#[test]
fn threaded_device_line_runs_off_the_caller() {
    let mut config = KernelConfig::default();
    config.timer.autostart_ticker = false;
    let kernel = boot(config).expect("boot");
    let hits = Arc::new(AtomicU64::new(0));
    let seen = hits.clone();
    kernel
        .irqs()
        .register_named(11, "nic", 0, IrqFlags::THREADED, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            IrqReturn::Handled
        })
        .expect("register");
    for _ in 0..3 {
        assert_eq!(kernel.raise_irq(11).expect("dispatch"), IrqReturn::Handled);
    }
    assert!(wait_until(Duration::from_secs(5), || hits.load(Ordering::SeqCst) >= 1));
    assert_eq!(kernel.raise_irq(300).map_err(|e| e.errno()), Err(kos_abi::Errno::EINVAL));
    kernel.shutdown();
}
