//! Per-handle serialization of foreign calls.
//!
//! The engine does not document whether a single engine or archive reference
//! may be used from several threads at once. [`CallPolicy::Serialized`] (the
//! default) therefore allows at most one outstanding call per handle:
//!
//! - asynchronous operations wait for the gate of every handle they touch and
//!   keep the resulting [`GatePass`] inside their completion closure, so the
//!   gate stays closed until the engine calls back;
//! - synchronous operations only try the gate and fail with
//!   [`BridgeError::Busy`] rather than block the calling thread.
//!
//! [`CallPolicy::Concurrent`] disables gating for engines known to be
//! thread-safe.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{BridgeError, BridgeResult};

/// How calls on one handle may overlap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CallPolicy {
    /// At most one outstanding call per handle.
    #[default]
    Serialized,
    /// No gating.
    Concurrent,
}

impl CallPolicy {
    /// Configuration spelling of the policy.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Serialized => "serialized",
            Self::Concurrent => "concurrent",
        }
    }
}

impl fmt::Display for CallPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallPolicy {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "serialized" => Ok(Self::Serialized),
            "concurrent" => Ok(Self::Concurrent),
            other => Err(BridgeError::Config(format!(
                "unknown call policy '{}' (expected 'serialized' or 'concurrent')",
                other
            ))),
        }
    }
}

/// Entry gate owned by one engine or archive facade.
#[derive(Debug)]
pub struct CallGate {
    kind: &'static str,
    lock: Option<Arc<Mutex<()>>>,
}

/// Proof of entry through a [`CallGate`]. The gate reopens when it drops.
#[must_use = "the gate reopens as soon as the pass is dropped"]
#[derive(Debug)]
pub struct GatePass(Option<OwnedMutexGuard<()>>);

impl CallGate {
    /// Create a gate for a handle of `kind` (used in `Busy` errors).
    pub fn new(kind: &'static str, policy: CallPolicy) -> Self {
        let lock = match policy {
            CallPolicy::Serialized => Some(Arc::new(Mutex::new(()))),
            CallPolicy::Concurrent => None,
        };
        Self { kind, lock }
    }

    /// A gate that never closes, usable in statics.
    pub const fn ungated(kind: &'static str) -> Self {
        Self { kind, lock: None }
    }

    /// The policy this gate enforces.
    pub fn policy(&self) -> CallPolicy {
        match self.lock {
            Some(_) => CallPolicy::Serialized,
            None => CallPolicy::Concurrent,
        }
    }

    /// Wait until no other call is outstanding on the handle.
    pub async fn enter(&self) -> GatePass {
        match &self.lock {
            Some(lock) => GatePass(Some(Arc::clone(lock).lock_owned().await)),
            None => GatePass(None),
        }
    }

    /// Enter without waiting.
    ///
    /// Fails with [`BridgeError::Busy`] while another call is outstanding.
    pub fn try_enter(&self) -> BridgeResult<GatePass> {
        match &self.lock {
            Some(lock) => Arc::clone(lock)
                .try_lock_owned()
                .map(|guard| GatePass(Some(guard)))
                .map_err(|_| BridgeError::Busy(self.kind)),
            None => Ok(GatePass(None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn test_policy_parses_case_insensitively() {
        assert_eq!("Serialized".parse::<CallPolicy>().unwrap(), CallPolicy::Serialized);
        assert_eq!(" concurrent ".parse::<CallPolicy>().unwrap(), CallPolicy::Concurrent);
        assert!(matches!(
            "parallel".parse::<CallPolicy>(),
            Err(BridgeError::Config(_))
        ));
    }

    #[test]
    fn test_default_policy_is_serialized() {
        assert_eq!(CallPolicy::default(), CallPolicy::Serialized);
        assert_eq!(CallPolicy::default().to_string(), "serialized");
    }

    #[test]
    fn test_serialized_gate_is_busy_while_pass_held() {
        let gate = CallGate::new("engine", CallPolicy::Serialized);
        let pass = gate.try_enter().unwrap();

        assert!(matches!(gate.try_enter(), Err(BridgeError::Busy("engine"))));

        drop(pass);
        assert!(gate.try_enter().is_ok());
    }

    #[test]
    fn test_concurrent_gate_never_blocks() {
        let gate = CallGate::new("archive", CallPolicy::Concurrent);
        let _first = gate.try_enter().unwrap();
        let _second = gate.try_enter().unwrap();

        assert_eq!(gate.policy(), CallPolicy::Concurrent);
        assert!(gate.enter().now_or_never().is_some());
    }

    #[test]
    fn test_static_ungated_gate() {
        static GATE: CallGate = CallGate::ungated("call");
        let _first = GATE.try_enter().unwrap();

        assert_eq!(GATE.policy(), CallPolicy::Concurrent);
        assert!(GATE.try_enter().is_ok());
    }

    #[tokio::test]
    async fn test_enter_waits_for_outstanding_pass() {
        let gate = CallGate::new("engine", CallPolicy::Serialized);
        let pass = gate.enter().await;

        let mut waiting = Box::pin(gate.enter());
        assert!(waiting.as_mut().now_or_never().is_none());

        drop(pass);
        let _pass = waiting.await;
        assert!(gate.try_enter().is_err());
    }
}
