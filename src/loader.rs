// loader.rs

use crate::augment::{self, load_rgb, AugRng, ImageTransform};
use crate::category::Category;
use crate::config::{AugmentationConfig, Config};
use crate::error::{Error, IoContext, Result};
use crate::partition::list_images;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tch::Tensor;

/// One image on disk and its category.
#[derive(Debug, Clone)]
pub struct Sample {
    pub path: PathBuf,
    pub category: Category,
}

/// Images in CHW layout, shape `[n, 3, size, size]`, and `[n]` int64 labels.
#[derive(Debug)]
pub struct Batch {
    pub images: Tensor,
    pub labels: Tensor,
    /// Positions of the batch's samples in the loader's sample list.
    pub indices: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub batch_size: usize,
    pub shuffle: bool,
    pub workers: usize,
    pub prefetch_depth: usize,
    pub seed: u64,
}

/// Decoded batch as produced on the worker side; tensors are built on the
/// consuming thread.
struct RawBatch {
    data: Vec<f32>,
    labels: Vec<i64>,
    indices: Vec<usize>,
}

/// Collects the samples of an image-folder split. Every category must have
/// its own non-empty sub-directory; any other sub-directory is an error.
pub fn scan_split(dir: &Path, num_categories: usize) -> Result<Vec<Sample>> {
    Category::ensure_count(num_categories)?;
    if !dir.is_dir() {
        return Err(Error::EmptySplit(dir.to_path_buf()));
    }

    let mut class_dirs: Vec<PathBuf> = fs::read_dir(dir)
        .at(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    class_dirs.sort();
    for class_dir in &class_dirs {
        let name = class_dir
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        name.parse::<Category>()?;
    }

    let mut samples = Vec::new();
    for category in Category::ALL {
        let class_dir = dir.join(category.name());
        if !class_dir.is_dir() {
            return Err(Error::MissingClassDir(class_dir));
        }
        let files = list_images(&class_dir)?;
        if files.is_empty() {
            return Err(Error::EmptyClassDir(class_dir));
        }
        tracing::debug!("  {} [{}]: {} images", category, category.index(), files.len());
        samples.extend(files.into_iter().map(|path| Sample { path, category }));
    }
    Ok(samples)
}

/// Restartable batch source over a fixed sample list. Each call to
/// [`DataLoader::iter`] is one pass in which every sample appears exactly once.
pub struct DataLoader {
    samples: Arc<Vec<Sample>>,
    transform: Arc<dyn ImageTransform>,
    opts: LoaderOptions,
    pool: Arc<rayon::ThreadPool>,
    epoch: u64,
}

impl DataLoader {
    pub fn new(
        samples: Vec<Sample>,
        transform: Arc<dyn ImageTransform>,
        opts: LoaderOptions,
    ) -> Result<Self> {
        if samples.is_empty() {
            return Err(Error::EmptySplit(PathBuf::new()));
        }
        if opts.batch_size == 0 || opts.prefetch_depth == 0 {
            return Err(Error::Config(vec![
                "batch size and prefetch depth must be positive".to_string(),
            ]));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(opts.workers.max(1))
            .thread_name(|i| format!("loader-{i}"))
            .build()
            .map_err(|e| Error::Worker(e.to_string()))?;
        Ok(Self {
            samples: Arc::new(samples),
            transform,
            opts,
            pool: Arc::new(pool),
            epoch: 0,
        })
    }

    pub fn from_dir(
        dir: &Path,
        num_categories: usize,
        transform: Arc<dyn ImageTransform>,
        opts: LoaderOptions,
    ) -> Result<Self> {
        let samples = scan_split(dir, num_categories)?;
        tracing::info!("{}: {} images", dir.display(), samples.len());
        Self::new(samples, transform, opts)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn num_batches(&self) -> usize {
        self.samples.len().div_ceil(self.opts.batch_size)
    }

    pub fn batch_size(&self) -> usize {
        self.opts.batch_size
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    fn pass_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.samples.len()).collect();
        if self.opts.shuffle {
            let mut rng = AugRng::seed_from_u64(self.opts.seed.wrapping_add(self.epoch));
            order.shuffle(&mut rng);
        }
        order
    }

    /// Starts a pass. Decoding runs on the worker pool while at most
    /// `prefetch_depth` batches wait in the queue.
    pub fn iter(&mut self) -> Result<Batches> {
        let order = self.pass_order();
        let epoch = self.epoch;
        self.epoch += 1;

        let expected = self.num_batches();
        let (tx, rx) = sync_channel::<Result<RawBatch>>(self.opts.prefetch_depth);
        let samples = Arc::clone(&self.samples);
        let transform = Arc::clone(&self.transform);
        let pool = Arc::clone(&self.pool);
        let batch_size = self.opts.batch_size;
        let seed = self.opts.seed;

        let handle = thread::Builder::new()
            .name("loader-producer".to_string())
            .spawn(move || {
                for chunk in order.chunks(batch_size) {
                    // ── 1. decode and augment the chunk on the worker pool ──
                    let decoded: Result<Vec<(Vec<f32>, i64)>> = pool.install(|| {
                        chunk
                            .par_iter()
                            .map(|&i| {
                                let sample = &samples[i];
                                // per-sample RNG, independent of worker scheduling
                                let mut rng = AugRng::seed_from_u64(sample_seed(seed, epoch, i));
                                let img = load_rgb(&sample.path)?;
                                Ok((transform.apply(img, &mut rng), sample.category.label()))
                            })
                            .collect()
                    });
                    // ── 2. flatten into one buffer in chunk order ──
                    let msg = decoded.map(|items| {
                        let mut data = Vec::with_capacity(items.iter().map(|(d, _)| d.len()).sum());
                        let mut labels = Vec::with_capacity(items.len());
                        for (d, l) in items {
                            data.extend_from_slice(&d);
                            labels.push(l);
                        }
                        RawBatch {
                            data,
                            labels,
                            indices: chunk.to_vec(),
                        }
                    });
                    // ── 3. hand over; blocks while the queue is full ──
                    // a closed receiver or a decode error ends the pass
                    let failed = msg.is_err();
                    if tx.send(msg).is_err() || failed {
                        break;
                    }
                }
            })
            .map_err(|e| Error::Worker(e.to_string()))?;

        Ok(Batches {
            rx: Some(rx),
            handle: Some(handle),
            size: self.transform.size() as i64,
            remaining: expected,
            failed: false,
        })
    }
}

fn sample_seed(seed: u64, epoch: u64, index: usize) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ epoch.rotate_left(32)
        ^ (index as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9)
}

/// One pass over a [`DataLoader`].
pub struct Batches {
    rx: Option<Receiver<Result<RawBatch>>>,
    handle: Option<JoinHandle<()>>,
    size: i64,
    remaining: usize,
    failed: bool,
}

impl Iterator for Batches {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining == 0 {
            return None;
        }
        let rx = self.rx.as_ref()?;
        match rx.recv() {
            Ok(Ok(raw)) => {
                self.remaining -= 1;
                let n = raw.labels.len() as i64;
                let images = Tensor::from_slice(&raw.data).view([n, 3, self.size, self.size]);
                let labels = Tensor::from_slice(&raw.labels);
                Some(Ok(Batch {
                    images,
                    labels,
                    indices: raw.indices,
                }))
            }
            Ok(Err(e)) => {
                self.failed = true;
                Some(Err(e))
            }
            Err(_) => {
                // producer ended before delivering every batch
                self.failed = true;
                Some(Err(Error::Worker(format!(
                    "{} batches were never produced",
                    self.remaining
                ))))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}

impl Drop for Batches {
    fn drop(&mut self) {
        // closing the receiver unblocks a producer waiting on a full queue
        self.rx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Train loader (shuffled, augmented) and validation loader (fixed order).
pub struct SplitLoaders {
    pub train: DataLoader,
    pub validation: DataLoader,
}

pub fn split_loaders(
    config: &Config,
    augmentation: &AugmentationConfig,
    batch_size: usize,
    num_categories: usize,
) -> Result<SplitLoaders> {
    let data = &config.data;
    let train = DataLoader::from_dir(
        &config.paths.train_dir(),
        num_categories,
        augment::train_transform(data.image_size, augmentation),
        LoaderOptions {
            batch_size,
            shuffle: true,
            workers: data.train_workers,
            prefetch_depth: data.prefetch_depth,
            seed: data.shuffle_seed,
        },
    )?;
    let validation = DataLoader::from_dir(
        &config.paths.validation_dir(),
        num_categories,
        augment::eval_transform(data.image_size),
        LoaderOptions {
            batch_size,
            shuffle: false,
            workers: data.validation_workers,
            prefetch_depth: data.prefetch_depth,
            seed: data.shuffle_seed,
        },
    )?;
    Ok(SplitLoaders { train, validation })
}

/// Shuffled, non-augmented loader over the test split.
pub fn test_loader(config: &Config, num_categories: usize) -> Result<DataLoader> {
    let data = &config.data;
    DataLoader::from_dir(
        &config.paths.test_dir(),
        num_categories,
        augment::eval_transform(data.image_size),
        LoaderOptions {
            batch_size: data.batch_size,
            shuffle: true,
            workers: data.test_workers,
            prefetch_depth: data.prefetch_depth,
            seed: data.shuffle_seed,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::augment::EvalTransform;
    use image::{Rgb, RgbImage};
    use std::collections::HashSet;

    fn write_split(root: &Path, per_class: usize) {
        for (ci, c) in Category::ALL.iter().enumerate() {
            let dir = root.join(c.name());
            fs::create_dir_all(&dir).unwrap();
            for i in 0..per_class {
                RgbImage::from_pixel(12, 10, Rgb([(ci * 40) as u8, i as u8, 7]))
                    .save(dir.join(format!("{i:03}.png")))
                    .unwrap();
            }
        }
    }

    fn opts(batch_size: usize, shuffle: bool) -> LoaderOptions {
        LoaderOptions {
            batch_size,
            shuffle,
            workers: 3,
            prefetch_depth: 2,
            seed: 42,
        }
    }

    fn collect_pass(loader: &mut DataLoader) -> Vec<Batch> {
        loader
            .iter()
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn pass_yields_every_sample_once() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), 5);
        let mut loader = DataLoader::from_dir(
            dir.path(),
            Category::COUNT,
            Arc::new(EvalTransform::new(8)),
            opts(4, true),
        )
        .unwrap();
        assert_eq!(loader.len(), 30);
        assert_eq!(loader.num_batches(), 8);

        let batches = collect_pass(&mut loader);
        assert_eq!(batches.len(), 8);
        assert_eq!(batches.last().unwrap().len(), 2);

        let mut seen = HashSet::new();
        for b in &batches {
            assert_eq!(b.images.size(), vec![b.len() as i64, 3, 8, 8]);
            assert_eq!(b.labels.size(), vec![b.len() as i64]);
            for &i in &b.indices {
                assert!(seen.insert(i), "sample {i} repeated");
            }
        }
        assert_eq!(seen.len(), 30);
    }

    #[test]
    fn labels_follow_category_order() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), 2);
        let mut loader = DataLoader::from_dir(
            dir.path(),
            Category::COUNT,
            Arc::new(EvalTransform::new(8)),
            opts(5, false),
        )
        .unwrap();
        for batch in collect_pass(&mut loader) {
            let labels = Vec::<i64>::try_from(&batch.labels).unwrap();
            for (label, idx) in labels.iter().zip(&batch.indices) {
                assert_eq!(*label, loader.samples()[*idx].category.label());
            }
        }
    }

    #[test]
    fn fixed_order_repeats_and_shuffle_changes() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), 6);
        let order = |loader: &mut DataLoader| -> Vec<usize> {
            collect_pass(loader).into_iter().flat_map(|b| b.indices).collect()
        };

        let mut fixed =
            DataLoader::from_dir(dir.path(), 6, Arc::new(EvalTransform::new(8)), opts(7, false))
                .unwrap();
        let first = order(&mut fixed);
        assert_eq!(first, (0..36).collect::<Vec<_>>());
        assert_eq!(order(&mut fixed), first);

        let mut shuffled =
            DataLoader::from_dir(dir.path(), 6, Arc::new(EvalTransform::new(8)), opts(7, true))
                .unwrap();
        let a = order(&mut shuffled);
        let b = order(&mut shuffled);
        assert_ne!(a, b);
        let mut sorted = b.clone();
        sorted.sort();
        assert_eq!(sorted, first);
    }

    #[test]
    fn undecodable_image_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), 2);
        let bad = dir.path().join("glass").join("broken.png");
        fs::write(&bad, b"not an image").unwrap();
        let mut loader =
            DataLoader::from_dir(dir.path(), 6, Arc::new(EvalTransform::new(8)), opts(4, false))
                .unwrap();
        let err = loader
            .iter()
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap_err();
        assert!(matches!(err, Error::Decode { path, .. } if path == bad));
    }

    #[test]
    fn unknown_class_folder_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), 1);
        fs::create_dir_all(dir.path().join("styrofoam")).unwrap();
        assert!(matches!(
            scan_split(dir.path(), 6),
            Err(Error::UnknownCategory(name)) if name == "styrofoam"
        ));
    }

    #[test]
    fn wrong_category_count_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), 1);
        assert!(matches!(
            scan_split(dir.path(), 5),
            Err(Error::CategoryCount { .. })
        ));
    }
}
