use std::{sync::Arc, thread};

use candle_core::{Device, Tensor};
use futures::{
    channel::mpsc::{self, Receiver},
    future::BoxFuture,
    SinkExt, StreamExt,
};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::{config::to_runtime_error, TrainingError};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// Indexable collection of samples; each sample is a tuple of tensors.
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Result<Vec<Tensor>>;
}

/// Samples held in memory, mostly useful for tests and tiny corpora.
#[derive(Debug, Clone, Default)]
pub struct TensorDataset {
    samples: Vec<Vec<Tensor>>,
}

impl TensorDataset {
    pub fn new(samples: Vec<Vec<Tensor>>) -> Self {
        Self { samples }
    }
}

impl Dataset for TensorDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<Vec<Tensor>> {
        self.samples.get(index).cloned().ok_or_else(|| {
            TrainingError::runtime(format!(
                "sample {} out of range for dataset of {}",
                index,
                self.samples.len()
            ))
        })
    }
}

/// Collated batch: sample fields stacked along a new leading dimension.
#[derive(Debug, Clone)]
pub struct DataBatch {
    pub tensors: Vec<Tensor>,
    pub index: usize,
    pub epoch: usize,
}

impl DataBatch {
    pub fn batch_size(&self) -> usize {
        self.tensors
            .first()
            .and_then(|tensor| tensor.dims().first().copied())
            .unwrap_or(0)
    }

    pub fn to_device(&self, device: &Device) -> Result<DataBatch> {
        let tensors = self
            .tensors
            .iter()
            .map(|tensor| tensor.to_device(device).map_err(to_runtime_error))
            .collect::<Result<Vec<_>>>()?;
        Ok(DataBatch {
            tensors,
            index: self.index,
            epoch: self.epoch,
        })
    }
}

/// Asynchronous-compatible loader abstraction.
pub trait DataLoader: Send {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<DataBatch>>>;
}

/// Blocking adapter around an async-friendly loader.
pub struct BlockingDataLoader<L>
where
    L: DataLoader,
{
    inner: L,
}

impl<L> BlockingDataLoader<L>
where
    L: DataLoader,
{
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    pub fn next_batch(&mut self) -> Result<Option<DataBatch>> {
        futures::executor::block_on(self.inner.next_batch())
    }
}

impl<L> Iterator for BlockingDataLoader<L>
where
    L: DataLoader,
{
    type Item = Result<DataBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub num_workers: usize,
    pub shuffle: bool,
    pub seed: u64,
    /// Batches each worker may build ahead of the consumer.
    pub prefetch_factor: usize,
}

impl LoaderConfig {
    pub fn new(batch_size: usize, num_workers: usize, shuffle: bool, seed: u64) -> Self {
        Self {
            batch_size,
            num_workers,
            shuffle,
            seed,
            prefetch_factor: 2,
        }
    }
}

/// Batching loader over a [`Dataset`].
///
/// Every call to [`BatchLoader::epoch`] yields one pass over the data. The
/// last batch may be short. With shuffling enabled the order is reseeded per
/// epoch from `seed + epoch`, so runs are reproducible. Worker `w` of `W`
/// collates batches `w, w + W, ...` into its own bounded channel and the
/// consumer drains the channels round-robin, which keeps the batch order
/// identical to the single-threaded one.
pub struct BatchLoader {
    dataset: Arc<dyn Dataset>,
    config: LoaderConfig,
    epoch: usize,
}

impl BatchLoader {
    pub fn new(dataset: Arc<dyn Dataset>, config: LoaderConfig) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        Ok(Self {
            dataset,
            config,
            epoch: 0,
        })
    }

    /// Number of batches per epoch.
    pub fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.config.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dataset_len(&self) -> usize {
        self.dataset.len()
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    pub fn epochs_started(&self) -> usize {
        self.epoch
    }

    pub fn epoch(&mut self) -> BlockingDataLoader<EpochBatches> {
        let epoch = self.epoch;
        self.epoch += 1;

        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.config.shuffle {
            let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        let batches: Vec<Vec<usize>> = order
            .chunks(self.config.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();

        let workers = self.config.num_workers.min(batches.len());
        let source = if workers == 0 {
            BatchSource::Inline {
                dataset: Arc::clone(&self.dataset),
                batches,
            }
        } else {
            spawn_workers(
                Arc::clone(&self.dataset),
                batches,
                workers,
                self.config.prefetch_factor.max(1),
                epoch,
            )
        };

        BlockingDataLoader::new(EpochBatches {
            source,
            epoch,
            next: 0,
            total: self.len(),
        })
    }
}

pub struct EpochBatches {
    source: BatchSource,
    epoch: usize,
    next: usize,
    total: usize,
}

enum BatchSource {
    Inline {
        dataset: Arc<dyn Dataset>,
        batches: Vec<Vec<usize>>,
    },
    Workers {
        receivers: Vec<Receiver<Result<DataBatch>>>,
        handles: Vec<thread::JoinHandle<()>>,
    },
}

impl EpochBatches {
    async fn advance(&mut self) -> Result<Option<DataBatch>> {
        if self.next >= self.total {
            return Ok(None);
        }
        let index = self.next;
        self.next += 1;

        match &mut self.source {
            BatchSource::Inline { dataset, batches } => {
                collate(dataset.as_ref(), &batches[index], index, self.epoch).map(Some)
            }
            BatchSource::Workers { receivers, .. } => {
                let worker = index % receivers.len();
                match receivers[worker].next().await {
                    Some(batch) => batch.map(Some),
                    None => Err(TrainingError::runtime(format!(
                        "data worker {} stopped before batch {}",
                        worker, index
                    ))),
                }
            }
        }
    }
}

impl DataLoader for EpochBatches {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<DataBatch>>> {
        Box::pin(self.advance())
    }
}

impl Drop for EpochBatches {
    fn drop(&mut self) {
        if let BatchSource::Workers { receivers, handles } = &mut self.source {
            // closing the channels unblocks workers parked on a full buffer
            receivers.clear();
            for handle in handles.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

fn spawn_workers(
    dataset: Arc<dyn Dataset>,
    batches: Vec<Vec<usize>>,
    workers: usize,
    prefetch: usize,
    epoch: usize,
) -> BatchSource {
    let batches = Arc::new(batches);
    let mut receivers = Vec::with_capacity(workers);
    let mut handles = Vec::with_capacity(workers);

    for worker in 0..workers {
        // futures' channel holds `buffer + senders` messages
        let (mut sender, receiver) = mpsc::channel(prefetch.saturating_sub(1));
        let dataset = Arc::clone(&dataset);
        let batches = Arc::clone(&batches);
        let handle = thread::spawn(move || {
            for index in (worker..batches.len()).step_by(workers) {
                let batch = collate(dataset.as_ref(), &batches[index], index, epoch);
                let failed = batch.is_err();
                if futures::executor::block_on(sender.send(batch)).is_err() || failed {
                    break;
                }
            }
        });
        receivers.push(receiver);
        handles.push(handle);
    }

    BatchSource::Workers { receivers, handles }
}

fn collate(dataset: &dyn Dataset, indices: &[usize], index: usize, epoch: usize) -> Result<DataBatch> {
    let samples = indices
        .iter()
        .map(|&i| dataset.get(i))
        .collect::<Result<Vec<_>>>()?;
    let fields = samples.first().map(Vec::len).unwrap_or(0);
    if samples.iter().any(|sample| sample.len() != fields) {
        return Err(TrainingError::runtime(format!(
            "batch {} mixes samples with different field counts",
            index
        )));
    }

    let mut tensors = Vec::with_capacity(fields);
    for field in 0..fields {
        let column: Vec<&Tensor> = samples.iter().map(|sample| &sample[field]).collect();
        tensors.push(Tensor::stack(&column, 0).map_err(to_runtime_error)?);
    }

    Ok(DataBatch {
        tensors,
        index,
        epoch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(n: usize) -> Arc<dyn Dataset> {
        let samples = (0..n)
            .map(|i| {
                vec![
                    Tensor::new(&[i as u32, i as u32], &Device::Cpu).unwrap(),
                    Tensor::new(i as f32, &Device::Cpu).unwrap(),
                ]
            })
            .collect();
        Arc::new(TensorDataset::new(samples))
    }

    fn first_column(batch: &DataBatch) -> Vec<f32> {
        batch.tensors[1].to_vec1::<f32>().unwrap()
    }

    #[test]
    fn keeps_the_short_final_batch() {
        let mut loader = BatchLoader::new(dataset(10), LoaderConfig::new(4, 0, false, 0)).unwrap();
        assert_eq!(loader.len(), 3);
        let batches: Vec<_> = loader.epoch().collect::<Result<_>>().unwrap();
        let sizes: Vec<_> = batches.iter().map(DataBatch::batch_size).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(batches[0].tensors[0].dims(), &[4, 2]);
        assert_eq!(first_column(&batches[2]), vec![8.0, 9.0]);
    }

    #[test]
    fn workers_preserve_the_inline_order() {
        let config = |workers| LoaderConfig::new(3, workers, true, 7);
        let mut inline = BatchLoader::new(dataset(20), config(0)).unwrap();
        let mut pooled = BatchLoader::new(dataset(20), config(3)).unwrap();
        let expected: Vec<_> = inline
            .epoch()
            .map(|batch| first_column(&batch.unwrap()))
            .collect();
        let actual: Vec<_> = pooled
            .epoch()
            .map(|batch| first_column(&batch.unwrap()))
            .collect();
        assert_eq!(expected.len(), 7);
        assert_eq!(expected, actual);
    }

    #[test]
    fn shuffles_differently_per_epoch() {
        let mut loader = BatchLoader::new(dataset(32), LoaderConfig::new(32, 0, true, 1)).unwrap();
        let first = first_column(&loader.epoch().next().unwrap().unwrap());
        let second = first_column(&loader.epoch().next().unwrap().unwrap());
        assert_ne!(first, second);
        let mut sorted = first.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(sorted, (0..32).map(|i| i as f32).collect::<Vec<_>>());
    }

    #[test]
    fn dropping_an_epoch_early_releases_workers() {
        let mut loader = BatchLoader::new(dataset(64), LoaderConfig::new(2, 4, false, 0)).unwrap();
        let mut epoch = loader.epoch();
        assert!(epoch.next_batch().unwrap().is_some());
        drop(epoch);
        assert_eq!(loader.epochs_started(), 1);
    }
}
