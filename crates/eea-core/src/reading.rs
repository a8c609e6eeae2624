//! Latest-value slot shared between a sensor producer and the guest host.

use parking_lot::Mutex;

/// Holds the most recent good sensor reading.
///
/// Writers replace the whole value and readers clone the whole value, each
/// under the lock; the lock is never held across I/O.
#[derive(Debug, Default)]
pub struct LatestReading {
    value: Mutex<Option<String>>,
}

impl LatestReading {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, reading: String) {
        *self.value.lock() = Some(reading);
    }

    /// Drop the cached value so stale data is never served.
    pub fn clear(&self) {
        *self.value.lock() = None;
    }

    pub fn get(&self) -> Option<String> {
        self.value.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_and_clear() {
        let slot = LatestReading::new();
        assert_eq!(slot.get(), None);

        slot.replace("[1,2]".into());
        slot.replace("[3,4]".into());
        assert_eq!(slot.get().as_deref(), Some("[3,4]"));

        slot.clear();
        assert_eq!(slot.get(), None);
    }
}
