//! Advisory locks stored as ordinary entries.
//!
//! A held lock is a row whose value is the acquisition time. Any lock taken
//! before the current server process started is stale and may be reclaimed.
//! The check-then-insert sequence is not atomic; it is safe only because the
//! server loop handles a single request at a time and owns the store.

use tracing::{debug, info, warn};

use crate::{error::StoreError, store::Store};

#[derive(Debug, Clone, Copy)]
pub struct LockManager {
    started_at: f64,
}

impl LockManager {
    pub fn new(started_at: f64) -> Self {
        Self { started_at }
    }

    pub fn started_at(&self) -> f64 {
        self.started_at
    }

    /// Returns `true` when the lock was acquired at `now`.
    pub fn lock(
        &self,
        store: &mut Store,
        table: &str,
        name: &str,
        now: f64,
    ) -> Result<bool, StoreError> {
        if let Some(held) = store.get(table, name)? {
            let held = held.trim();
            if !held.is_empty() {
                match held.parse::<f64>() {
                    Ok(taken_at) if taken_at >= self.started_at => {
                        debug!(table, name, taken_at, "lock already held");
                        return Ok(false);
                    }
                    Ok(taken_at) => info!(table, name, taken_at, "removing stale lock"),
                    Err(_) => warn!(table, name, value = held, "reclaiming unreadable lock"),
                }
            }
            store.remove(table, name)?;
        }

        store.set(table, name, &now.to_string())?;
        info!(table, name, "locked");
        Ok(true)
    }

    pub fn unlock(&self, store: &mut Store, table: &str, name: &str) -> Result<bool, StoreError> {
        store.remove(table, name)?;
        debug!(table, name, "unlocked");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: f64 = 1_700_000_000.0;

    #[test]
    fn second_lock_fails_until_unlocked() {
        let mut store = Store::in_memory().unwrap();
        let locks = LockManager::new(START);

        assert!(locks.lock(&mut store, "t", "job", START + 1.0).unwrap());
        assert!(!locks.lock(&mut store, "t", "job", START + 2.0).unwrap());
        assert!(locks.unlock(&mut store, "t", "job").unwrap());
        assert!(locks.lock(&mut store, "t", "job", START + 3.0).unwrap());
    }

    #[test]
    fn lock_from_before_start_is_reclaimed() {
        let mut store = Store::in_memory().unwrap();
        store.set("t", "job", &(START - 60.0).to_string()).unwrap();

        let locks = LockManager::new(START);
        assert!(locks.lock(&mut store, "t", "job", START + 5.0).unwrap());
        assert_eq!(
            store.get("t", "job").unwrap().as_deref(),
            Some((START + 5.0).to_string().as_str())
        );
    }

    #[test]
    fn unreadable_lock_is_reclaimed() {
        let mut store = Store::in_memory().unwrap();
        store.set("t", "job", "garbage").unwrap();
        let locks = LockManager::new(START);
        assert!(locks.lock(&mut store, "t", "job", START).unwrap());
    }

    #[test]
    fn locks_are_scoped_by_table_and_name() {
        let mut store = Store::in_memory().unwrap();
        let locks = LockManager::new(START);
        assert!(locks.lock(&mut store, "a", "job", START).unwrap());
        assert!(locks.lock(&mut store, "b", "job", START).unwrap());
        assert!(locks.lock(&mut store, "a", "other", START).unwrap());
    }

    #[test]
    fn unlock_of_missing_lock_succeeds() {
        let mut store = Store::in_memory().unwrap();
        let locks = LockManager::new(START);
        assert!(locks.unlock(&mut store, "t", "nothing").unwrap());
    }
}
