use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Single-flight registry: at most one job per target key at a time.
#[derive(Debug, Clone, Default)]
pub struct TargetGuards {
    busy: Arc<Mutex<HashSet<String>>>,
}

impl TargetGuards {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`, or `None` when another job already holds it. The claim is
    /// released when the returned guard is dropped.
    pub fn try_acquire(&self, key: &str) -> Option<TargetGuard> {
        let mut busy = self.busy.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !busy.insert(key.to_string()) {
            return None;
        }
        Some(TargetGuard {
            busy: Arc::clone(&self.busy),
            key: key.to_string(),
        })
    }

    pub fn is_busy(&self, key: &str) -> bool {
        self.busy
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(key)
    }
}

#[derive(Debug)]
pub struct TargetGuard {
    busy: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for TargetGuard {
    fn drop(&mut self) {
        let mut busy = self.busy.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        busy.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_on_same_target_is_refused() {
        let guards = TargetGuards::new();
        let first = guards.try_acquire("public.orders").expect("first claim");
        assert!(guards.try_acquire("public.orders").is_none());
        assert!(guards.try_acquire("public.items").is_some());
        drop(first);
        assert!(!guards.is_busy("public.orders"));
        assert!(guards.try_acquire("public.orders").is_some());
    }
}
