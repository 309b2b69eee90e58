use crate::types::EpochSnapshot;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub const DEFAULT_WINDOW_CAPACITY: usize = 5;

struct WindowState {
    epochs: VecDeque<Arc<EpochSnapshot>>,
    epoch_size: u64,
}

/// Bounded cache of recent epoch snapshots, ascending by first block number.
///
/// Only the `WorkersParameterized` handler writes; readers get `Arc`ed
/// snapshots that stay valid after later pushes evict them.
pub struct EpochParameterWindow {
    state: Arc<RwLock<WindowState>>,
    capacity: usize,
}

impl EpochParameterWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(WindowState {
                epochs: VecDeque::with_capacity(capacity),
                epoch_size: 0,
            })),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a new epoch, evicting the oldest when over capacity.
    ///
    /// Snapshots not strictly newer than the latest one are dropped: an epoch
    /// published while the window was bootstrapping arrives twice. Returns
    /// whether the snapshot was accepted.
    pub async fn push(&self, snapshot: EpochSnapshot) -> bool {
        let mut state = self.state.write().await;
        let first_block_number = snapshot.first_block_number;
        if let Some(latest) = state.epochs.back() {
            if first_block_number <= latest.first_block_number {
                debug!(
                    first_block_number,
                    latest = latest.first_block_number,
                    "Ignoring stale epoch parameters"
                );
                return false;
            }
        }
        state.epochs.push_back(Arc::new(snapshot));

        while state.epochs.len() > self.capacity {
            if let Some(evicted) = state.epochs.pop_front() {
                debug!(
                    first_block_number = evicted.first_block_number,
                    "Evicted epoch from window"
                );
            }
        }

        info!(
            first_block_number,
            window_len = state.epochs.len(),
            "🎲 New epoch parameters"
        );
        true
    }

    /// Load the full remote window once at startup.
    ///
    /// The ledger may return the cycle starting mid-way, so the input is
    /// sorted rather than trusted.
    pub async fn bootstrap(&self, mut snapshots: Vec<EpochSnapshot>, epoch_size: u64) {
        snapshots.sort_by_key(|s| s.first_block_number);
        let skip = snapshots.len().saturating_sub(self.capacity);

        let mut state = self.state.write().await;
        state.epoch_size = epoch_size;
        state.epochs = snapshots.into_iter().skip(skip).map(Arc::new).collect();

        info!(
            epoch_size,
            window_len = state.epochs.len(),
            first_block_number = state.epochs.front().map(|e| e.first_block_number),
            "🧬 Epoch window bootstrapped"
        );
    }

    pub async fn set_epoch_size(&self, epoch_size: u64) {
        self.state.write().await.epoch_size = epoch_size;
    }

    pub async fn epoch_size(&self) -> u64 {
        self.state.read().await.epoch_size
    }

    /// Snapshot whose epoch contains `block_number`, or `None` when the block
    /// lies outside the cached window (the caller cannot verify yet)
    pub async fn find_for_block(&self, block_number: u64) -> Option<Arc<EpochSnapshot>> {
        let state = self.state.read().await;
        if state.epoch_size == 0 {
            return None;
        }

        let first = state.epochs.front()?;
        let offset = block_number.checked_sub(first.first_block_number)?;
        let index = usize::try_from(offset / state.epoch_size).ok()?;

        state.epochs.get(index).cloned()
    }

    pub async fn latest(&self) -> Option<Arc<EpochSnapshot>> {
        self.state.read().await.epochs.back().cloned()
    }

    pub async fn snapshots(&self) -> Vec<Arc<EpochSnapshot>> {
        self.state.read().await.epochs.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.epochs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.epochs.is_empty()
    }
}

impl Default for EpochParameterWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Address;
    use num_bigint::BigUint;

    fn epoch(first_block_number: u64) -> EpochSnapshot {
        EpochSnapshot::new(
            BigUint::from(first_block_number),
            first_block_number,
            vec![Address::from_bytes([1; 20])],
            vec![BigUint::from(1u8)],
            0,
        )
        .unwrap()
    }

    async fn first_blocks(window: &EpochParameterWindow) -> Vec<u64> {
        window
            .snapshots()
            .await
            .iter()
            .map(|e| e.first_block_number)
            .collect()
    }

    #[tokio::test]
    async fn test_bootstrap_rotates_wrapped_cycle() {
        let window = EpochParameterWindow::new(5);
        window
            .bootstrap(
                vec![epoch(300), epoch(400), epoch(0), epoch(100), epoch(200)],
                100,
            )
            .await;

        assert_eq!(first_blocks(&window).await, vec![0, 100, 200, 300, 400]);
        assert_eq!(window.epoch_size().await, 100);
    }

    #[tokio::test]
    async fn test_bootstrap_keeps_newest_when_oversized() {
        let window = EpochParameterWindow::new(3);
        window
            .bootstrap(
                vec![epoch(400), epoch(0), epoch(300), epoch(100), epoch(200)],
                100,
            )
            .await;

        assert_eq!(first_blocks(&window).await, vec![200, 300, 400]);
    }

    #[tokio::test]
    async fn test_push_evicts_oldest() {
        let window = EpochParameterWindow::new(5);
        window
            .bootstrap((0..5).map(|i| epoch(i * 100)).collect(), 100)
            .await;

        window.push(epoch(500)).await;
        assert_eq!(first_blocks(&window).await, vec![100, 200, 300, 400, 500]);
        assert_eq!(window.len().await, 5);
        assert_eq!(window.latest().await.unwrap().first_block_number, 500);
    }

    #[tokio::test]
    async fn test_push_ignores_replayed_and_older_epochs() {
        let window = EpochParameterWindow::new(5);
        window
            .bootstrap((0..5).map(|i| epoch(i * 100)).collect(), 100)
            .await;

        // Published during bootstrap, then delivered again by the subscription
        assert!(!window.push(epoch(400)).await);
        assert!(!window.push(epoch(250)).await);
        assert!(window.push(epoch(500)).await);

        assert_eq!(first_blocks(&window).await, vec![100, 200, 300, 400, 500]);
        assert_eq!(
            window.find_for_block(550).await.unwrap().first_block_number,
            500
        );
    }

    #[tokio::test]
    async fn test_find_for_block_boundaries() {
        let window = EpochParameterWindow::new(5);

        // Empty window
        assert!(window.find_for_block(150).await.is_none());

        window
            .bootstrap(vec![epoch(1000), epoch(1100), epoch(1200)], 100)
            .await;

        // Before coverage
        assert!(window.find_for_block(999).await.is_none());
        // Inside
        assert_eq!(
            window.find_for_block(1000).await.unwrap().first_block_number,
            1000
        );
        assert_eq!(
            window.find_for_block(1199).await.unwrap().first_block_number,
            1100
        );
        assert_eq!(
            window.find_for_block(1299).await.unwrap().first_block_number,
            1200
        );
        // After coverage
        assert!(window.find_for_block(1300).await.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_survives_eviction() {
        let window = EpochParameterWindow::new(1);
        window.bootstrap(vec![epoch(0)], 10).await;

        let held = window.find_for_block(5).await.unwrap();
        window.push(epoch(10)).await;

        assert_eq!(held.first_block_number, 0);
        assert!(window.find_for_block(5).await.is_none());
    }

    #[tokio::test]
    async fn test_missing_epoch_size_finds_nothing() {
        let window = EpochParameterWindow::new(5);
        window.push(epoch(0)).await;
        assert!(window.find_for_block(0).await.is_none());

        window.set_epoch_size(50).await;
        assert!(window.find_for_block(0).await.is_some());
    }
}
