//! Target sequencer
//!
//! A [`Token`] owns the ordered list of targets for one protocol and tracks
//! which one is currently being probed. Advancing is the only mutation and is
//! a single atomic read-modify-write, so overlapping cycles for the same
//! protocol can never probe the same target twice or skip one.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::ensure;

/// Circular sequencer over a fixed, non-empty target list.
///
/// Created once per protocol at startup and never destroyed. Cloning shares
/// the position, so every clone observes the same rotation.
#[derive(Debug, Clone)]
pub struct Token {
    targets: Arc<[String]>,
    position: Arc<AtomicUsize>,
}

impl Token {
    /// Create a sequencer positioned at the first target.
    ///
    /// An empty target list is a configuration error and prevents startup.
    pub fn new(targets: Vec<String>) -> anyhow::Result<Self> {
        ensure!(
            !targets.is_empty(),
            "target list must not be empty (configuration error)"
        );

        Ok(Self {
            targets: targets.into(),
            position: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// The target currently being probed.
    pub fn current(&self) -> String {
        let index = self.position.load(Ordering::SeqCst) % self.targets.len();
        self.targets[index].clone()
    }

    /// Move to the next target, wrapping at the end of the list.
    ///
    /// Called exactly once per completed probe sequence, successful or not -
    /// monitoring must never get stuck on one target.
    pub fn advance(&self) {
        self.position.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of targets in the rotation.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        false // construction rejects empty lists
    }
}
