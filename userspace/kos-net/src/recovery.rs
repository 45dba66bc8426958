// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Network error recovery: maps each error kind to a recovery action and
//! rate-limits handling so an error storm degrades into silent drops.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::NetError;

/// Errors handled per second before the rest are dropped silently.
pub const ERRORS_PER_SEC: u32 = 100;
const WINDOW_NS: u64 = 1_000_000_000;

/// Error classes the recovery table distinguishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// Header validation failed.
    Malformed,
    /// Checksum mismatch.
    Checksum,
    /// No route to the destination.
    NoRoute,
    /// Next hop did not resolve.
    HostUnreachable,
    /// Queue or buffer exhausted.
    NoBufs,
    /// Retransmission or wait timeout.
    Timeout,
    /// Peer reset or refused the connection.
    Connection,
    /// Datagram too large for the path.
    MsgSize,
    /// Device transmit failure.
    Device,
    /// Anything else.
    Other,
}

impl ErrorKind {
    /// Class of `err`.
    pub fn of(err: NetError) -> Self {
        match err {
            NetError::Malformed(_) => Self::Malformed,
            NetError::Checksum => Self::Checksum,
            NetError::NoRoute => Self::NoRoute,
            NetError::HostUnreachable => Self::HostUnreachable,
            NetError::NoBufs | NetError::WouldBlock => Self::NoBufs,
            NetError::TimedOut => Self::Timeout,
            NetError::ConnReset | NetError::ConnRefused | NetError::ConnAborted => Self::Connection,
            NetError::MsgSize => Self::MsgSize,
            _ => Self::Other,
        }
    }
}

/// What the stack does about an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RecoveryAction {
    /// Discard the packet.
    Drop,
    /// Try again with exponential backoff.
    Retry {
        /// Attempts before giving up.
        attempts: u32,
        /// Delay before the first retry.
        backoff_ms: u64,
    },
    /// Use an alternative path (default route, fragmentation).
    Fallback,
    /// Slow the sender down.
    Throttle,
    /// Tear down the connection.
    ResetConnection,
    /// Take the failing component out of service.
    Isolate,
}

impl RecoveryAction {
    /// Delay before retry number `attempt` (0-based), or `None` once the
    /// attempts are used up or the action is not a retry.
    pub fn backoff_ms(&self, attempt: u32) -> Option<u64> {
        match *self {
            Self::Retry { attempts, backoff_ms } if attempt < attempts => {
                Some(backoff_ms.saturating_mul(1u64 << attempt.min(16)))
            }
            _ => None,
        }
    }
}

/// Recovery counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryStats {
    /// Errors handled per kind.
    pub handled: Vec<(ErrorKind, u64)>,
    /// Errors dropped by the rate limit.
    pub suppressed: u64,
}

struct Limiter {
    window_start_ns: u64,
    in_window: u32,
    suppressed: u64,
    handled: HashMap<ErrorKind, u64>,
}

/// Recovery table with a per-second rate limit.
pub struct ErrorRecovery {
    table: Mutex<HashMap<ErrorKind, RecoveryAction>>,
    limit: u32,
    state: Mutex<Limiter>,
}

impl ErrorRecovery {
    /// Default table limited to `per_sec` handled errors per second.
    pub fn new(per_sec: u32) -> Self {
        let table = HashMap::from([
            (ErrorKind::Malformed, RecoveryAction::Drop),
            (ErrorKind::Checksum, RecoveryAction::Drop),
            (ErrorKind::NoRoute, RecoveryAction::Fallback),
            (ErrorKind::HostUnreachable, RecoveryAction::Retry { attempts: 3, backoff_ms: 1000 }),
            (ErrorKind::NoBufs, RecoveryAction::Throttle),
            (ErrorKind::Timeout, RecoveryAction::Retry { attempts: 5, backoff_ms: 200 }),
            (ErrorKind::Connection, RecoveryAction::ResetConnection),
            (ErrorKind::MsgSize, RecoveryAction::Fallback),
            (ErrorKind::Device, RecoveryAction::Isolate),
            (ErrorKind::Other, RecoveryAction::Drop),
        ]);
        Self {
            table: Mutex::new(table),
            limit: per_sec,
            state: Mutex::new(Limiter { window_start_ns: 0, in_window: 0, suppressed: 0, handled: HashMap::new() }),
        }
    }

    /// Overrides the action for `kind`.
    pub fn set_action(&self, kind: ErrorKind, action: RecoveryAction) {
        self.table.lock().insert(kind, action);
    }

    /// Action for `kind` without counting.
    pub fn action(&self, kind: ErrorKind) -> RecoveryAction {
        self.table.lock().get(&kind).copied().unwrap_or(RecoveryAction::Drop)
    }

    /// Classifies and handles `err`.
    pub fn handle(&self, err: NetError, now_ns: u64) -> Option<RecoveryAction> {
        self.handle_kind(ErrorKind::of(err), now_ns)
    }

    /// Handles an error of `kind`. `None` means the rate limit swallowed it.
    pub fn handle_kind(&self, kind: ErrorKind, now_ns: u64) -> Option<RecoveryAction> {
        {
            let mut st = self.state.lock();
            if now_ns.saturating_sub(st.window_start_ns) >= WINDOW_NS {
                st.window_start_ns = now_ns;
                st.in_window = 0;
            }
            if st.in_window >= self.limit {
                st.suppressed += 1;
                return None;
            }
            st.in_window += 1;
            *st.handled.entry(kind).or_default() += 1;
        }
        let action = self.action(kind);
        log::debug!("net: {:?} -> {:?}", kind, action);
        Some(action)
    }

    /// Counters.
    pub fn stats(&self) -> RecoveryStats {
        let st = self.state.lock();
        let mut handled: Vec<(ErrorKind, u64)> = st.handled.iter().map(|(k, v)| (*k, *v)).collect();
        handled.sort_by_key(|(k, _)| format!("{k:?}"));
        RecoveryStats { handled, suppressed: st.suppressed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table() {
        let r = ErrorRecovery::new(ERRORS_PER_SEC);
        assert_eq!(r.handle(NetError::Checksum, 0), Some(RecoveryAction::Drop));
        assert_eq!(r.handle(NetError::ConnReset, 0), Some(RecoveryAction::ResetConnection));
        assert_eq!(r.handle(NetError::NoBufs, 0), Some(RecoveryAction::Throttle));
        assert_eq!(r.handle_kind(ErrorKind::Device, 0), Some(RecoveryAction::Isolate));
        r.set_action(ErrorKind::Checksum, RecoveryAction::Isolate);
        assert_eq!(r.handle(NetError::Checksum, 0), Some(RecoveryAction::Isolate));
    }

    #[test]
    fn rate_limit_per_second() {
        let r = ErrorRecovery::new(ERRORS_PER_SEC);
        for _ in 0..ERRORS_PER_SEC {
            assert!(r.handle(NetError::Malformed("x"), 5).is_some());
        }
        assert_eq!(r.handle(NetError::Malformed("x"), 999_999_999), None);
        assert_eq!(r.stats().suppressed, 1);
        assert!(r.handle(NetError::Malformed("x"), 1_000_000_005).is_some());
        assert_eq!(r.stats().handled, vec![(ErrorKind::Malformed, u64::from(ERRORS_PER_SEC) + 1)]);
    }

    #[test]
    fn retry_backoff_doubles_until_exhausted() {
        let a = RecoveryAction::Retry { attempts: 3, backoff_ms: 100 };
        assert_eq!(a.backoff_ms(0), Some(100));
        assert_eq!(a.backoff_ms(2), Some(400));
        assert_eq!(a.backoff_ms(3), None);
        assert_eq!(RecoveryAction::Drop.backoff_ms(0), None);
    }
}
