//! Bounded pool of network ports handed out in contiguous blocks.
//!
//! The allocator is deterministic: the same pool state and the same request
//! always produce the same block (the lowest-numbered free run that fits).
//! It holds no locks of its own; callers that share it between flows must
//! guard it together with whatever records own the blocks.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Errors returned by [`PortAllocator`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    /// No free contiguous run of the requested length exists.
    #[error("no contiguous block of {requested} free ports ({free} ports free in total)")]
    ResourceExhausted { requested: usize, free: usize },

    /// The request exceeds the configured per-instance maximum.
    #[error("requested block of {requested} ports exceeds the maximum of {max}")]
    BlockTooLarge { requested: usize, max: usize },

    /// A block must contain at least one port.
    #[error("cannot allocate an empty port block")]
    EmptyBlock,

    /// A released port is outside the pool or not currently held.
    #[error("port {port} is not currently allocated")]
    NotAllocated { port: u16 },

    /// The configured range is empty.
    #[error("invalid port range {min}-{max}")]
    InvalidRange { min: u16, max: u16 },
}

/// A contiguous run of ports owned by a single instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PortBlock {
    start: u16,
    len: u16,
}

impl PortBlock {
    /// The first port of the block; this is the instance's assigned port.
    pub fn first(&self) -> u16 {
        self.start
    }

    pub fn last(&self) -> u16 {
        self.start + (self.len - 1)
    }

    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.start..=self.last()
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.last()).contains(&port)
    }

    pub fn overlaps(&self, other: &PortBlock) -> bool {
        self.start <= other.last() && other.start <= self.last()
    }
}

impl fmt::Display for PortBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.len == 1 {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.last())
        }
    }
}

/// Hands out contiguous port blocks from the inclusive range `[min, max]`.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    min: u16,
    max: u16,
    max_block: Option<usize>,
    /// `held[i]` is true while port `min + i` belongs to a live block.
    held: Vec<bool>,
}

impl PortAllocator {
    /// Create a pool over `[min, max]`.
    ///
    /// `max_block` bounds the size of a single allocation; `None` means
    /// unbounded (the pool size is the only limit).
    pub fn new(min: u16, max: u16, max_block: Option<usize>) -> Result<Self, PortError> {
        if min > max {
            return Err(PortError::InvalidRange { min, max });
        }
        let size = usize::from(max - min) + 1;
        Ok(Self {
            min,
            max,
            max_block,
            held: vec![false; size],
        })
    }

    pub fn min(&self) -> u16 {
        self.min
    }

    pub fn max(&self) -> u16 {
        self.max
    }

    pub fn capacity(&self) -> usize {
        self.held.len()
    }

    pub fn free_count(&self) -> usize {
        self.held.iter().filter(|held| !**held).count()
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.index_of(port).is_some_and(|i| self.held[i])
    }

    /// Allocate the lowest-numbered free run of `block_size` ports.
    ///
    /// Fails with [`PortError::ResourceExhausted`] when no run is long
    /// enough, even if enough ports are free in fragmented pieces.
    pub fn allocate(&mut self, block_size: usize) -> Result<PortBlock, PortError> {
        if block_size == 0 {
            return Err(PortError::EmptyBlock);
        }
        if let Some(max) = self.max_block {
            if block_size > max {
                return Err(PortError::BlockTooLarge {
                    requested: block_size,
                    max,
                });
            }
        }

        let mut run_start = 0;
        let mut run_len = 0;
        for (i, held) in self.held.iter().enumerate() {
            if *held {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = i;
            }
            run_len += 1;
            if run_len == block_size {
                break;
            }
        }

        if run_len < block_size {
            return Err(PortError::ResourceExhausted {
                requested: block_size,
                free: self.free_count(),
            });
        }

        for held in &mut self.held[run_start..run_start + block_size] {
            *held = true;
        }

        // Both values are bounded by the pool size, which fits in a u16 range.
        Ok(PortBlock {
            start: self.min + run_start as u16,
            len: block_size as u16,
        })
    }

    /// Return every port of `block` to the free set.
    ///
    /// Releasing a port that is not currently held fails without touching
    /// the pool, so a double release leaves the other ports intact.
    pub fn release(&mut self, block: &PortBlock) -> Result<(), PortError> {
        let mut indices = Vec::with_capacity(block.len());
        for port in block.ports() {
            match self.index_of(port) {
                Some(i) if self.held[i] => indices.push(i),
                _ => return Err(PortError::NotAllocated { port }),
            }
        }
        for i in indices {
            self.held[i] = false;
        }
        Ok(())
    }

    fn index_of(&self, port: u16) -> Option<usize> {
        if port < self.min || port > self.max {
            return None;
        }
        Some(usize::from(port - self.min))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pool(min: u16, max: u16) -> PortAllocator {
        PortAllocator::new(min, max, None).unwrap()
    }

    #[test]
    fn test_allocates_lowest_free_block() {
        let mut ports = pool(9000, 9009);
        assert_eq!(ports.allocate(1).unwrap().first(), 9000);
        assert_eq!(ports.allocate(1).unwrap().first(), 9001);
        let block = ports.allocate(3).unwrap();
        assert_eq!(block.ports().collect::<Vec<_>>(), vec![9002, 9003, 9004]);
        assert_eq!(ports.free_count(), 5);
    }

    #[test]
    fn test_release_then_allocate_returns_same_block() {
        let mut ports = pool(9000, 9009);
        ports.allocate(2).unwrap();
        let block = ports.allocate(3).unwrap();
        ports.release(&block).unwrap();
        assert_eq!(ports.allocate(3).unwrap(), block);
    }

    #[test]
    fn test_fragmented_pool_reuses_released_block() {
        let mut ports = pool(9000, 9003);
        let first = ports.allocate(2).unwrap();
        let second = ports.allocate(2).unwrap();
        assert_eq!(first.ports().collect::<Vec<_>>(), vec![9000, 9001]);
        assert_eq!(second.ports().collect::<Vec<_>>(), vec![9002, 9003]);

        ports.release(&first).unwrap();
        assert_eq!(ports.allocate(2).unwrap(), first);
        assert!(matches!(
            ports.allocate(2),
            Err(PortError::ResourceExhausted { requested: 2, .. })
        ));
    }

    #[test]
    fn test_fragmentation_exhausts_even_with_enough_free_ports() {
        let mut ports = pool(9000, 9003);
        let blocks: Vec<_> = (0..4).map(|_| ports.allocate(1).unwrap()).collect();
        ports.release(&blocks[0]).unwrap();
        ports.release(&blocks[2]).unwrap();

        assert_eq!(ports.free_count(), 2);
        assert_eq!(
            ports.allocate(2),
            Err(PortError::ResourceExhausted {
                requested: 2,
                free: 2
            })
        );
    }

    #[test]
    fn test_double_release_fails_without_mutation() {
        let mut ports = pool(9000, 9003);
        let block = ports.allocate(2).unwrap();
        let other = ports.allocate(1).unwrap();
        ports.release(&block).unwrap();

        assert_eq!(
            ports.release(&block),
            Err(PortError::NotAllocated { port: 9000 })
        );
        assert!(ports.is_allocated(other.first()));
        assert_eq!(ports.free_count(), 3);
    }

    #[test]
    fn test_release_of_foreign_port_is_rejected() {
        let mut ports = pool(9000, 9003);
        let mut outside = pool(8000, 8003);
        let foreign = outside.allocate(1).unwrap();
        assert_eq!(
            ports.release(&foreign),
            Err(PortError::NotAllocated { port: 8000 })
        );
    }

    #[test]
    fn test_block_size_limits() {
        let mut ports = PortAllocator::new(9000, 9009, Some(2)).unwrap();
        assert_eq!(ports.allocate(0), Err(PortError::EmptyBlock));
        assert_eq!(
            ports.allocate(3),
            Err(PortError::BlockTooLarge {
                requested: 3,
                max: 2
            })
        );
        assert_eq!(ports.allocate(2).unwrap().len(), 2);
    }

    #[test]
    fn test_invalid_range() {
        assert_eq!(
            PortAllocator::new(9001, 9000, None).unwrap_err(),
            PortError::InvalidRange {
                min: 9001,
                max: 9000
            }
        );
        assert_eq!(PortAllocator::new(9000, 9000, None).unwrap().capacity(), 1);
    }

    #[test]
    fn test_block_display() {
        let mut ports = pool(9000, 9009);
        assert_eq!(ports.allocate(1).unwrap().to_string(), "9000");
        assert_eq!(ports.allocate(3).unwrap().to_string(), "9001-9003");
    }

    #[derive(Debug, Clone)]
    enum Op {
        Allocate(usize),
        Release(usize),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1usize..4).prop_map(Op::Allocate),
            (0usize..8).prop_map(Op::Release),
        ]
    }

    /// Apply `ops` to a fresh pool, returning every allocation outcome.
    fn run_ops(ops: &[Op]) -> (Vec<Result<PortBlock, PortError>>, Vec<PortBlock>, PortAllocator) {
        let mut ports = pool(9000, 9011);
        let mut live: Vec<PortBlock> = Vec::new();
        let mut outcomes = Vec::new();
        for op in ops {
            match op {
                Op::Allocate(n) => {
                    let result = ports.allocate(*n);
                    if let Ok(block) = &result {
                        live.push(*block);
                    }
                    outcomes.push(result);
                }
                Op::Release(i) if !live.is_empty() => {
                    let block = live.remove(i % live.len());
                    ports.release(&block).unwrap();
                }
                Op::Release(_) => {}
            }
        }
        (outcomes, live, ports)
    }

    proptest! {
        #[test]
        fn live_blocks_never_overlap(ops in proptest::collection::vec(arb_op(), 0..60)) {
            let (_, live, ports) = run_ops(&ops);
            for (i, a) in live.iter().enumerate() {
                for b in &live[i + 1..] {
                    prop_assert!(!a.overlaps(b), "{} overlaps {}", a, b);
                }
            }
            let held: usize = live.iter().map(PortBlock::len).sum();
            prop_assert_eq!(ports.free_count(), ports.capacity() - held);
        }

        #[test]
        fn allocation_is_deterministic(ops in proptest::collection::vec(arb_op(), 0..60)) {
            let (first, _, _) = run_ops(&ops);
            let (second, _, _) = run_ops(&ops);
            prop_assert_eq!(first, second);
        }
    }
}
