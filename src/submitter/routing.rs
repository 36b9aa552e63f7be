//! Queue selection.
//!
//! A PBN always maps to the same queue: `rotation_interval` consecutive
//! blocks share a queue before the next queue takes over, so sequential I/O
//! stays together (and can merge) while the address space still spreads over
//! every thread. Work with no address is spread by a rotor instead.
//!
//! ```text
//!   queues = 2, rotation_interval = 2
//!   PBN    0 1 2 3 4 5 6 7
//!   queue  0 0 1 1 0 0 1 1
//! ```

use std::sync::atomic::{AtomicU32, Ordering};

use crate::bio::PhysicalBlockNumber;
use crate::error::{Error, Result};

/// Pure PBN → queue mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueRouting {
    queue_count: u32,
    rotation_interval: u32,
}

impl QueueRouting {
    pub fn new(queue_count: u32, rotation_interval: u32) -> Result<Self> {
        if queue_count == 0 || rotation_interval == 0 {
            return Err(Error::Config(format!(
                "queue routing needs non-zero queue count and rotation interval (got {} and {})",
                queue_count, rotation_interval
            )));
        }
        if queue_count.checked_mul(rotation_interval).is_none() {
            return Err(Error::Config(format!(
                "queue count {} × rotation interval {} overflows",
                queue_count, rotation_interval
            )));
        }
        Ok(Self {
            queue_count,
            rotation_interval,
        })
    }

    pub fn queue_count(&self) -> usize {
        self.queue_count as usize
    }

    pub fn rotation_interval(&self) -> u32 {
        self.rotation_interval
    }

    /// Length of one full rotation through every queue.
    #[inline]
    fn span(&self) -> u64 {
        u64::from(self.queue_count) * u64::from(self.rotation_interval)
    }

    /// Queue that owns `pbn`.
    #[inline]
    pub fn queue_for_pbn(&self, pbn: PhysicalBlockNumber) -> usize {
        ((pbn % self.span()) / u64::from(self.rotation_interval)) as usize
    }
}

/// Round-robin counter for address-less work.
///
/// The counter wraps at `u32::MAX`; when the rotation span does not divide
/// 2^32 the wrap costs a little fairness, which is accepted.
#[derive(Debug, Default)]
pub struct BioRotor {
    ticks: AtomicU32,
}

impl BioRotor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue for the next address-less item.
    pub fn advance(&self, routing: &QueueRouting) -> usize {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed);
        routing.queue_for_pbn(u64::from(tick))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_zero() {
        assert!(QueueRouting::new(0, 1).is_err());
        assert!(QueueRouting::new(1, 0).is_err());
        assert!(QueueRouting::new(u32::MAX, 2).is_err());
    }

    #[test]
    fn test_rotation_interval_one() {
        let routing = QueueRouting::new(4, 1).unwrap();
        let queues: Vec<usize> = (0..5).map(|pbn| routing.queue_for_pbn(pbn)).collect();
        assert_eq!(queues, vec![0, 1, 2, 3, 0]);
    }

    #[test]
    fn test_rotation_interval_two() {
        let routing = QueueRouting::new(2, 2).unwrap();
        let queues: Vec<usize> = (0..6).map(|pbn| routing.queue_for_pbn(pbn)).collect();
        assert_eq!(queues, vec![0, 0, 1, 1, 0, 0]);
    }

    #[test]
    fn test_large_pbn() {
        let routing = QueueRouting::new(3, 64).unwrap();
        let pbn = u64::MAX;
        assert!(routing.queue_for_pbn(pbn) < 3);
        assert_eq!(routing.queue_for_pbn(pbn), routing.queue_for_pbn(pbn));
    }

    #[test]
    fn test_rotor_round_robin() {
        let routing = QueueRouting::new(3, 2).unwrap();
        let rotor = BioRotor::new();
        let picks: Vec<usize> = (0..12).map(|_| rotor.advance(&routing)).collect();
        assert_eq!(picks, vec![0, 0, 1, 1, 2, 2, 0, 0, 1, 1, 2, 2]);
    }

    #[test]
    fn test_rotor_wraps() {
        let routing = QueueRouting::new(2, 1).unwrap();
        let rotor = BioRotor {
            ticks: AtomicU32::new(u32::MAX),
        };
        assert_eq!(rotor.advance(&routing), 1);
        assert_eq!(rotor.advance(&routing), 0);
    }
}
