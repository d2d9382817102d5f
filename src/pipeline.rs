use crate::assign::{Accumulator, AssignmentEngine, ReadEvent};
use crate::bam_input::{self, BamStats, ReadTags, RecordFilter};
use crate::quant::Quantification;
use anyhow::{Result, anyhow};
use crossfire::mpmc;
use std::path::Path;
use std::thread;

/// Events handed to a worker in one message.
pub const DEFAULT_BATCH_SIZE: usize = 4096;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub threads: usize,
    pub batch_size: usize,
    pub tags: ReadTags,
    pub filter: RecordFilter,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            threads: 1,
            batch_size: DEFAULT_BATCH_SIZE,
            tags: ReadTags::default(),
            filter: RecordFilter::default(),
        }
    }
}

/// Worker that owns every read of `seqname`. Reads of one molecule share a
/// chromosome, so deduplication never spans workers.
pub fn shard_of(seqname: &str, shards: usize) -> usize {
    let h = seqname
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ b as u64).wrapping_mul(0x0100_0000_01b3));
    (h % shards.max(1) as u64) as usize
}

/// Quantify a BAM against the engine's panel.
pub fn run_quantify(bam: &Path, engine: &AssignmentEngine<'_>, opts: &RunOptions) -> Result<(Quantification, BamStats)> {
    if opts.threads <= 1 {
        let mut acc = Accumulator::new();
        let stats = bam_input::read_events(bam, &opts.tags, &opts.filter, |event| {
            engine.observe(&mut acc, &event);
            Ok(())
        })?;
        return Ok((engine.finish(acc), stats));
    }
    run_sharded(opts.threads, opts.batch_size, engine, |sink| {
        bam_input::read_events(bam, &opts.tags, &opts.filter, sink)
    })
}

/// Fan events out to `workers` threads by chromosome, then merge the
/// per-worker results. `produce` drives the event stream through the sink it
/// is given.
pub fn run_sharded<P, S>(workers: usize, batch_size: usize, engine: &AssignmentEngine<'_>, produce: P) -> Result<(Quantification, S)>
where
    P: FnOnce(&mut dyn FnMut(ReadEvent) -> Result<()>) -> Result<S>,
{
    crossfire::detect_backoff_cfg();
    let workers = workers.max(1);
    let batch_size = batch_size.max(1);

    thread::scope(|scope| -> Result<(Quantification, S)> {
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = mpmc::bounded_blocking::<Vec<ReadEvent>>(4);
            senders.push(tx);
            handles.push(scope.spawn(move || {
                let mut acc = Accumulator::new();
                while let Ok(batch) = rx.recv() {
                    for event in &batch {
                        engine.observe(&mut acc, event);
                    }
                }
                engine.finish(acc)
            }));
        }

        let mut buffers: Vec<Vec<ReadEvent>> = (0..workers).map(|_| Vec::with_capacity(batch_size)).collect();
        let mut sink = |event: ReadEvent| -> Result<()> {
            let shard = shard_of(&event.seqname, workers);
            buffers[shard].push(event);
            if buffers[shard].len() >= batch_size {
                let batch = std::mem::replace(&mut buffers[shard], Vec::with_capacity(batch_size));
                senders[shard]
                    .send(batch)
                    .map_err(|_| anyhow!("worker {shard} channel closed"))?;
            }
            Ok(())
        };
        let produced = produce(&mut sink);

        for (shard, batch) in buffers.into_iter().enumerate() {
            if !batch.is_empty() && produced.is_ok() {
                senders[shard]
                    .send(batch)
                    .map_err(|_| anyhow!("worker {shard} channel closed"))?;
            }
        }
        drop(senders);

        let mut total = Quantification::default();
        for handle in handles {
            let part = handle.join().map_err(|_| anyhow!("quantification worker panicked"))?;
            total.merge(part);
        }
        let produced = produced?;
        tracing::debug!(workers, "merged worker results");
        Ok((total, produced))
    })
}
