//! Volume Concurrency Limiter Module
//!
//! The kubelet may issue calls for the same volume concurrently, for example when two pods on
//! the same node use the same volume, and it retries calls which timed out while the original
//! call is still being served. The reference counting decision of an unmount is only safe if
//! no other operation changes the mounts of the volume in the meantime, so every operation on
//! a volume holds its [`VolumeOpGuard`] from the first read until the last action.
//! Operations on different volumes proceed independently.
use crate::attachment::VolumeId;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::OwnedMutexGuard;
use tracing::trace;

type Inventory = Arc<Mutex<HashMap<VolumeId, Arc<tokio::sync::Mutex<()>>>>>;

/// Per-volume locks of a single controller.
#[derive(Debug, Default, Clone)]
pub struct VolumeLocks {
    inventory: Inventory,
}

impl VolumeLocks {
    /// Create a new `Self` with no volume locked.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock of the given volume, waiting for any in-flight operation on the same
    /// volume to complete first.
    pub async fn lock(&self, volume: &VolumeId) -> VolumeOpGuard {
        let lock = self.inventory.lock().entry(volume.clone()).or_default().clone();
        let guard = match lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                trace!(%volume, "Operation already in progress for volume, waiting");
                lock.lock_owned().await
            }
        };
        trace!(%volume, "New reservation");
        VolumeOpGuard {
            volume: volume.clone(),
            inventory: self.inventory.clone(),
            guard: Some(guard),
        }
    }

    /// Number of volumes with an operation in flight or waiting.
    pub fn in_flight(&self) -> usize {
        self.inventory.lock().len()
    }
}

/// This operation guard ensures there is no more than 1 in-flight operation for a given
/// volume. When this is dropped the reservation is returned and the next operation waiting
/// on the volume, if any, proceeds.
#[derive(Debug)]
pub struct VolumeOpGuard {
    volume: VolumeId,
    inventory: Inventory,
    guard: Option<OwnedMutexGuard<()>>,
}

impl VolumeOpGuard {
    /// The volume this guard reserves.
    pub fn volume(&self) -> &VolumeId {
        &self.volume
    }
}

impl Drop for VolumeOpGuard {
    fn drop(&mut self) {
        let mut inventory = self.inventory.lock();
        self.guard.take();
        // only the inventory holds it now, nobody is waiting
        if let Some(lock) = inventory.get(&self.volume) {
            if Arc::strong_count(lock) == 1 {
                inventory.remove(&self.volume);
            }
        }
        trace!(volume = %self.volume, "Reservation returned");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    #[tokio::test]
    async fn released_on_drop() {
        let locks = VolumeLocks::new();
        let volume = VolumeId::new("pool1", "image1");
        {
            let guard = locks.lock(&volume).await;
            assert_eq!(guard.volume(), &volume);
            assert_eq!(locks.in_flight(), 1);
        }
        assert_eq!(locks.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn serialized_per_volume() {
        let locks = VolumeLocks::new();
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let tasks = (0 .. 8)
            .map(|_| {
                let locks = locks.clone();
                let active = active.clone();
                let max_active = max_active.clone();
                tokio::spawn(async move {
                    let _guard = locks.lock(&VolumeId::new("pool1", "image1")).await;
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert_eq!(locks.in_flight(), 0);
    }

    #[tokio::test]
    async fn independent_volumes() {
        let locks = VolumeLocks::new();
        let _first = locks.lock(&VolumeId::new("pool1", "image1")).await;
        let second = tokio::time::timeout(
            Duration::from_secs(1),
            locks.lock(&VolumeId::new("pool1", "image2")),
        )
        .await;
        assert!(second.is_ok());
        assert_eq!(locks.in_flight(), 2);
    }
}
