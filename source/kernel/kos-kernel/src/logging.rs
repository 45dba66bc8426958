// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Process-wide logger installation.

use once_cell::sync::OnceCell;

static INSTALLED: OnceCell<bool> = OnceCell::new();

/// Installs `env_logger` at `level`; `RUST_LOG` overrides it when set.
///
/// Only the first call has an effect. Returns false when another logger
/// already owned the `log` facade.
pub fn init(level: log::LevelFilter) -> bool {
    *INSTALLED.get_or_init(|| {
        let installed = env_logger::Builder::new()
            .filter_level(level)
            .parse_default_env()
            .format_timestamp_micros()
            .try_init()
            .is_ok();
        if installed {
            log::info!("logging: env_logger at {}", level);
        }
        installed
    })
}
