// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: kosd host entrypoint: boot from `KOS_CONFIG`, run for a while, dump stats
//! OWNERS: @kernel-team
//! PUBLIC API: main() (host)
//! DEPENDS_ON: kos_kernel::{boot, KernelConfig, logging}

#![forbid(unsafe_code)]

use std::process::ExitCode;
use std::time::Duration;

use kos_kernel::{boot, logging, KernelConfig};

fn main() -> ExitCode {
    logging::init(log::LevelFilter::Info);
    // Optional first argument: seconds to run before shutting down.
    let secs = std::env::args().nth(1).and_then(|s| s.parse::<u64>().ok()).unwrap_or(1);

    let config = match KernelConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("kosd: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let kernel = match boot(config) {
        Ok(kernel) => kernel,
        Err(e) => {
            log::error!("kosd: boot failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    println!("kosd: ready");
    std::thread::sleep(Duration::from_secs(secs));

    match kernel.stats_json() {
        Ok(json) => println!("{}", json),
        Err(e) => log::warn!("kosd: cannot render stats: {}", e),
    }
    kernel.shutdown();
    ExitCode::SUCCESS
}
