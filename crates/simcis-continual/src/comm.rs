//! Collective communication between data-parallel workers.
//!
//! Every call is a synchronous barrier: all ranks must reach it, in the same
//! order. A rank that never arrives blocks the others indefinitely.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use simcis_core::{Error, Result};

/// Interface for cross-worker operations.
pub trait Collective: Send + Sync {
    /// Rank of this worker (0 to world_size - 1).
    fn rank(&self) -> usize;

    /// Number of workers.
    fn world_size(&self) -> usize;

    /// Exchange one payload per rank; every rank receives all payloads in
    /// rank order.
    fn all_gather(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>>;

    /// Element-wise sum across ranks, in place.
    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<()> {
        if self.world_size() == 1 {
            return Ok(());
        }
        let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let gathered = self.all_gather(payload)?;

        values.iter_mut().for_each(|v| *v = 0.0);
        for bytes in gathered {
            if bytes.len() != values.len() * 8 {
                return Err(Error::Collective(format!(
                    "all_reduce payload of {} bytes, expected {}",
                    bytes.len(),
                    values.len() * 8
                )));
            }
            for (v, chunk) in values.iter_mut().zip(bytes.chunks_exact(8)) {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                *v += f64::from_le_bytes(raw);
            }
        }
        Ok(())
    }

    /// Whether this worker writes shared artifacts.
    fn is_main(&self) -> bool {
        self.rank() == 0
    }
}

/// Single-worker run: every collective is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_gather(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        Ok(vec![payload])
    }
}

struct Round {
    generation: u64,
    arrived: usize,
    slots: Vec<Option<Vec<u8>>>,
    result: Option<Arc<Vec<Vec<u8>>>>,
}

struct Rendezvous {
    world_size: usize,
    round: Mutex<Round>,
    ready: Condvar,
}

/// In-process worker group; each member is moved to its own thread.
pub struct LocalGroup;

impl LocalGroup {
    pub fn new(world_size: usize) -> Vec<LocalCollective> {
        let shared = Arc::new(Rendezvous {
            world_size,
            round: Mutex::new(Round {
                generation: 0,
                arrived: 0,
                slots: vec![None; world_size],
                result: None,
            }),
            ready: Condvar::new(),
        });
        (0..world_size)
            .map(|rank| LocalCollective {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

/// One rank of a [`LocalGroup`].
pub struct LocalCollective {
    rank: usize,
    shared: Arc<Rendezvous>,
}

impl Collective for LocalCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn all_gather(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        let mut round = self.shared.round.lock();
        let generation = round.generation;
        if round.slots[self.rank].is_some() {
            return Err(Error::Collective(format!(
                "rank {} entered round {generation} twice",
                self.rank
            )));
        }
        round.slots[self.rank] = Some(payload);
        round.arrived += 1;

        if round.arrived == self.shared.world_size {
            let gathered: Vec<Vec<u8>> = round
                .slots
                .iter_mut()
                .map(|slot| slot.take().unwrap_or_default())
                .collect();
            let gathered = Arc::new(gathered);
            round.result = Some(Arc::clone(&gathered));
            round.arrived = 0;
            round.generation += 1;
            self.shared.ready.notify_all();
            return Ok(gathered.as_ref().clone());
        }

        while round.generation == generation {
            self.shared.ready.wait(&mut round);
        }
        round
            .result
            .as_ref()
            .map(|r| r.as_ref().clone())
            .ok_or_else(|| Error::Collective("round finished without a result".to_string()))
    }
}
