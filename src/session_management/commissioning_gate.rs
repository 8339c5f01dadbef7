use log::debug;
use std::sync::Mutex;

/// Admits one new commissioning attempt at a time.
///
/// A fresh start holds the gate from admission until it connects, fails or
/// is stopped. Recovery starts never touch it.
#[derive(Debug, Default)]
pub struct CommissioningGate {
    holder: Mutex<Option<String>>,
}

impl CommissioningGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the gate for `target_id`. On refusal returns the current holder.
    pub fn try_acquire(&self, target_id: &str) -> Result<(), String> {
        let mut holder = self.holder.lock().unwrap_or_else(|p| p.into_inner());
        match holder.as_deref() {
            Some(current) if current != target_id => Err(current.to_string()),
            _ => {
                *holder = Some(target_id.to_string());
                debug!("Commissioning gate taken by {}", target_id);
                Ok(())
            }
        }
    }

    /// Frees the gate if `target_id` holds it.
    pub fn release(&self, target_id: &str) -> bool {
        let mut holder = self.holder.lock().unwrap_or_else(|p| p.into_inner());
        if holder.as_deref() == Some(target_id) {
            *holder = None;
            debug!("Commissioning gate released by {}", target_id);
            true
        } else {
            false
        }
    }

    pub fn holder(&self) -> Option<String> {
        self.holder
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_holder() {
        let gate = CommissioningGate::new();
        assert!(gate.try_acquire("a").is_ok());
        assert!(gate.try_acquire("a").is_ok());
        assert_eq!(gate.try_acquire("b"), Err("a".to_string()));
        assert!(!gate.release("b"));
        assert!(gate.release("a"));
        assert_eq!(gate.holder(), None);
        assert!(gate.try_acquire("b").is_ok());
        assert_eq!(gate.holder().as_deref(), Some("b"));
    }
}
