//! Background batch producer with a bounded queue
//!
//! A named worker thread shuffles each epoch, collates micro-batches and
//! pushes them into a bounded channel; a full queue blocks the producer. The
//! order of examples and the masking of every batch depend only on
//! `(seed, epoch, batch index)`, so a resumed run sees the same stream.

use crate::error::{HarnessError, HarnessResult};
use crate::objective::{Batch, EncodedExample, Objective};
use log::{debug, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;

#[derive(Debug)]
pub enum PrefetchItem {
    Batch { epoch: u32, index: usize, batch: Batch },
    EpochEnd { epoch: u32 },
}

/// Where the stream starts: epoch and micro-batches already consumed in it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataCursor {
    pub epoch: u32,
    pub batches_in_epoch: usize,
}

fn mix(seed: u64, a: u64, b: u64) -> u64 {
    seed ^ a.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ b.wrapping_mul(0xC2B2_AE3D_27D4_EB4F)
}

/// Example order for one epoch
pub fn epoch_order(len: usize, seed: u64, epoch: u32) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    order.shuffle(&mut StdRng::seed_from_u64(mix(seed, epoch as u64 + 1, 0)));
    order
}

pub struct BatchPrefetcher {
    rx: mpsc::Receiver<PrefetchItem>,
    worker: Option<JoinHandle<()>>,
}

impl BatchPrefetcher {
    pub fn spawn(
        objective: Arc<Objective>,
        examples: Arc<Vec<EncodedExample>>,
        batch_size: usize,
        seed: u64,
        start: DataCursor,
        depth: usize,
    ) -> HarnessResult<Self> {
        if examples.is_empty() {
            return Err(HarnessError::Data("training split is empty".into()));
        }
        let (tx, rx) = mpsc::channel(depth.max(1));
        let worker = std::thread::Builder::new()
            .name("lmtune-prefetch".into())
            .spawn(move || produce(&objective, &examples, batch_size, seed, start, tx))?;
        Ok(Self {
            rx,
            worker: Some(worker),
        })
    }

    /// Next item; blocks until the producer has one ready
    pub fn next_item(&mut self) -> Option<PrefetchItem> {
        self.rx.blocking_recv()
    }
}

fn produce(
    objective: &Objective,
    examples: &[EncodedExample],
    batch_size: usize,
    seed: u64,
    start: DataCursor,
    tx: mpsc::Sender<PrefetchItem>,
) {
    let mut epoch = start.epoch;
    let mut skip = start.batches_in_epoch;
    loop {
        let order = epoch_order(examples.len(), seed, epoch);
        for (index, chunk) in order.chunks(batch_size).enumerate().skip(skip) {
            let refs: Vec<&EncodedExample> = chunk.iter().map(|&i| &examples[i]).collect();
            let mut rng = StdRng::seed_from_u64(mix(seed, epoch as u64 + 1, index as u64 + 1));
            let batch = objective.collate(&refs, &mut rng);
            if tx.blocking_send(PrefetchItem::Batch { epoch, index, batch }).is_err() {
                return;
            }
        }
        if tx.blocking_send(PrefetchItem::EpochEnd { epoch }).is_err() {
            return;
        }
        debug!("prefetch: epoch {epoch} produced");
        skip = 0;
        epoch += 1;
    }
}

impl Drop for BatchPrefetcher {
    fn drop(&mut self) {
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Batch prefetch worker panicked");
            }
        }
    }
}
