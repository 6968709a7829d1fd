//! Weighted interleaving of record containers with pipelined decoding.
//!
//! One interleaver thread draws records from per-container cursors by
//! weighted random choice and hands them out in chunks; `num_threads`
//! decoder threads turn each record into a [`SampledTile`].
//!
//! Without `infinite`, a cursor leaves the pool once exhausted. With
//! non-uniform weights the under-weighted containers can still run out
//! first, after which the remaining draws come only from the rest: some
//! records of over-represented containers are then never drawn. This is
//! expected and is the price of honouring the weights.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use image::{imageops, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::core::encode::{decode_rgb, JpegTileEncoder, TileEncoder};
use crate::core::record::{container_name, decode_record, index_path_for, IndexedContainer};
use crate::dataset::{Dataset, Label};
use crate::extract::StainNormalizer;

const POLL: Duration = Duration::from_millis(50);

/// Random augmentations, parsed from a flag string such as `"xyrjb"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Augment {
    pub flip_x: bool,
    pub flip_y: bool,
    pub rotate: bool,
    pub jpeg: bool,
    pub blur: bool,
}

impl Augment {
    pub fn is_none(&self) -> bool {
        *self == Self::default()
    }
}

impl FromStr for Augment {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut aug = Augment::default();
        for c in s.chars() {
            match c {
                'x' => aug.flip_x = true,
                'y' => aug.flip_y = true,
                'r' => aug.rotate = true,
                'j' => aug.jpeg = true,
                'b' => aug.blur = true,
                _ => return Err(format!("unknown augmentation '{}' in '{}'. Available: x, y, r, j, b", c, s)),
            }
        }
        Ok(aug)
    }
}

#[derive(Clone)]
pub struct SamplerOptions {
    /// Per-container draw weights; uniform when absent.
    pub weights: Option<BTreeMap<PathBuf, f64>>,
    /// Per-container record caps.
    pub clips: BTreeMap<PathBuf, usize>,
    pub infinite: bool,
    /// `(rank, num_replicas)`.
    pub shard: (usize, usize),
    pub seed: u64,
    pub chunk_size: usize,
    pub num_threads: usize,
    /// Chunks buffered between the interleaver and the decoders.
    pub raw_queue_depth: usize,
    /// Decoded tiles buffered for the consumer.
    pub decoded_queue_depth: usize,
    pub augment: Augment,
    /// Output `img / 127.5 - 1` as CHW floats instead of RGB bytes.
    pub standardize: bool,
    pub include_loc: bool,
    pub labels: HashMap<String, Label>,
    pub normalizer: Option<Arc<dyn StainNormalizer>>,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        Self {
            weights: None,
            clips: BTreeMap::new(),
            infinite: false,
            shard: (0, 1),
            seed: 0,
            chunk_size: 8,
            num_threads: 4,
            raw_queue_depth: 1,
            decoded_queue_depth: 64,
            augment: Augment::default(),
            standardize: false,
            include_loc: false,
            labels: HashMap::new(),
            normalizer: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedImage {
    Rgb8(RgbImage),
    /// Channel-major `3 x height x width` values in `[-1, 1]`.
    Standardized { width: u32, height: u32, data: Vec<f32> },
}

impl DecodedImage {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            DecodedImage::Rgb8(img) => img.dimensions(),
            DecodedImage::Standardized { width, height, .. } => (*width, *height),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampledTile {
    pub slide: String,
    pub label: Option<Label>,
    pub image: DecodedImage,
    pub loc: Option<(i64, i64)>,
}

/// Read position over the records of one container that belong to this shard.
struct Cursor {
    container: Arc<IndexedContainer>,
    records: Vec<usize>,
    next: usize,
    weight: f64,
}

impl Cursor {
    fn draw(&mut self, infinite: bool) -> Option<usize> {
        if self.next >= self.records.len() {
            if !infinite || self.records.is_empty() {
                return None;
            }
            self.next = 0;
        }
        let i = self.records[self.next];
        self.next += 1;
        Some(i)
    }
}

type RawChunk = Vec<(Arc<IndexedContainer>, usize)>;

/// Streams decoded tiles from a set of containers. Iterating yields
/// `Result<SampledTile>`; a corrupt record surfaces as an error item.
/// Dropping the sampler (or calling [`TileSampler::close`]) stops and joins
/// every background thread.
pub struct TileSampler {
    rx: Option<Receiver<Result<SampledTile>>>,
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

fn send_polling<T>(tx: &Sender<T>, mut item: T, stop: &AtomicBool) -> bool {
    loop {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        match tx.send_timeout(item, POLL) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => item = back,
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

fn open_container(path: &Path) -> Result<IndexedContainer> {
    let index = index_path_for(path);
    if !index.exists() {
        return Err(anyhow!("index file not found for container {} (expected {})", path.display(), index.display()));
    }
    IndexedContainer::open(path).with_context(|| format!("Opening {}", path.display()))
}

impl TileSampler {
    pub fn new(containers: &[PathBuf], opts: SamplerOptions) -> Result<Self> {
        let (rank, replicas) = opts.shard;
        if replicas == 0 || rank >= replicas {
            return Err(anyhow!("invalid shard {} of {}", rank, replicas));
        }
        if opts.chunk_size == 0 || opts.num_threads == 0 {
            return Err(anyhow!("chunk_size and num_threads must be at least 1"));
        }

        let mut cursors = Vec::with_capacity(containers.len());
        for path in containers {
            let container = Arc::new(open_container(path)?);
            let mut records: Vec<usize> = (0..container.len()).filter(|i| i % replicas == rank).collect();
            if let Some(&clip) = opts.clips.get(path) {
                records.truncate(clip / replicas);
            }
            let weight = match &opts.weights {
                Some(w) => w.get(path).copied().unwrap_or(0.0),
                None => 1.0,
            };
            debug!("{}: {} records in shard {}/{}, weight {:.4}", path.display(), records.len(), rank, replicas, weight);
            cursors.push(Cursor { container, records, next: 0, weight });
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (raw_tx, raw_rx) = bounded::<RawChunk>(opts.raw_queue_depth.max(1));
        let (out_tx, out_rx) = bounded::<Result<SampledTile>>(opts.decoded_queue_depth.max(1));
        let mut handles = Vec::with_capacity(opts.num_threads + 1);

        {
            let stop = Arc::clone(&stop);
            let (infinite, chunk_size, seed) = (opts.infinite, opts.chunk_size, opts.seed);
            handles.push(
                thread::Builder::new()
                    .name("sampler-interleave".into())
                    .spawn(move || interleave(cursors, raw_tx, infinite, chunk_size, seed, &stop))?,
            );
        }
        let opts = Arc::new(opts);
        for t in 0..opts.num_threads {
            let (raw_rx, out_tx, stop, opts) = (raw_rx.clone(), out_tx.clone(), Arc::clone(&stop), Arc::clone(&opts));
            handles.push(
                thread::Builder::new()
                    .name(format!("sampler-decode-{}", t))
                    .spawn(move || decode_worker(t, raw_rx, out_tx, &opts, &stop))?,
            );
        }

        info!("Sampling {} containers with {} decoder threads", containers.len(), opts.num_threads);
        Ok(Self { rx: Some(out_rx), stop, handles })
    }

    /// Sample the containers of a dataset view, taking weights and clips
    /// from its balance and clip state unless already set in `opts`.
    pub fn from_dataset(dataset: &Dataset, mut opts: SamplerOptions) -> Result<Self> {
        if opts.weights.is_none() {
            opts.weights = dataset.prob_weights()?;
        }
        if opts.clips.is_empty() {
            opts.clips = dataset.clip_map()?;
        }
        let containers: Vec<PathBuf> = dataset.manifest()?.into_keys().collect();
        Self::new(&containers, opts)
    }

    /// Stop the pipeline and join every thread.
    pub fn close(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.rx = None;
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("Sampler thread panicked");
            }
        }
    }
}

impl Iterator for TileSampler {
    type Item = Result<SampledTile>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.as_ref()?.recv().ok()
    }
}

impl Drop for TileSampler {
    fn drop(&mut self) {
        self.close();
    }
}

fn interleave(
    mut cursors: Vec<Cursor>,
    raw_tx: Sender<RawChunk>,
    infinite: bool,
    chunk_size: usize,
    seed: u64,
    stop: &AtomicBool,
) {
    let mut rng = StdRng::seed_from_u64(seed);
    cursors.retain(|c| c.weight > 0.0 && !c.records.is_empty());
    let mut chunk: RawChunk = Vec::with_capacity(chunk_size);
    let mut drawn = 0usize;

    while !cursors.is_empty() && !stop.load(Ordering::Relaxed) {
        let total: f64 = cursors.iter().map(|c| c.weight).sum();
        let mut target = rng.random_range(0.0..total);
        let mut pick = cursors.len() - 1;
        for (i, c) in cursors.iter().enumerate() {
            if target < c.weight {
                pick = i;
                break;
            }
            target -= c.weight;
        }
        match cursors[pick].draw(infinite) {
            Some(record) => {
                chunk.push((Arc::clone(&cursors[pick].container), record));
                drawn += 1;
            }
            None => {
                debug!("{} exhausted", cursors[pick].container.path().display());
                cursors.swap_remove(pick);
                continue;
            }
        }
        if chunk.len() == chunk_size {
            let full = std::mem::replace(&mut chunk, Vec::with_capacity(chunk_size));
            if !send_polling(&raw_tx, full, stop) {
                return;
            }
        }
    }
    if !chunk.is_empty() {
        send_polling(&raw_tx, chunk, stop);
    }
    debug!("Interleaver finished after {} draws", drawn);
}

fn decode_worker(
    thread_index: usize,
    raw_rx: Receiver<RawChunk>,
    out_tx: Sender<Result<SampledTile>>,
    opts: &SamplerOptions,
    stop: &AtomicBool,
) {
    let mut rng = StdRng::seed_from_u64(opts.seed.wrapping_add(1 + thread_index as u64));
    loop {
        let chunk = match raw_rx.recv_timeout(POLL) {
            Ok(chunk) => chunk,
            Err(RecvTimeoutError::Timeout) => {
                if stop.load(Ordering::Relaxed) {
                    return;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => return,
        };
        for (container, record) in chunk {
            let item = match decode_one(&container, record, opts, &mut rng) {
                Ok(Some(tile)) => Ok(tile),
                Ok(None) => continue,
                Err(e) => Err(e.context(format!("{} record {}", container_name(container.path()), record))),
            };
            if !send_polling(&out_tx, item, stop) {
                return;
            }
        }
    }
}

/// `Ok(None)` when the normalizer rejects the tile.
fn decode_one(
    container: &IndexedContainer,
    index: usize,
    opts: &SamplerOptions,
    rng: &mut StdRng,
) -> Result<Option<SampledTile>> {
    let record = decode_record(container.payload(index)?)?;
    let mut img = decode_rgb(&record.image_raw)?;
    if !opts.augment.is_none() {
        img = augment(img, opts.augment, rng)?;
    }
    if let Some(normalizer) = &opts.normalizer {
        match normalizer.transform(&img) {
            Ok(out) => img = out,
            Err(e) => {
                debug!("{}: {} failed on record {}: {}", record.slide, normalizer.name(), index, e);
                return Ok(None);
            }
        }
    }
    let image = if opts.standardize { standardize(&img) } else { DecodedImage::Rgb8(img) };
    Ok(Some(SampledTile {
        label: opts.labels.get(&record.slide).cloned(),
        loc: opts.include_loc.then_some((record.loc_x, record.loc_y)),
        slide: record.slide,
        image,
    }))
}

fn augment(mut img: RgbImage, aug: Augment, rng: &mut StdRng) -> Result<RgbImage> {
    if aug.flip_x && rng.random_bool(0.5) {
        img = imageops::flip_horizontal(&img);
    }
    if aug.flip_y && rng.random_bool(0.5) {
        img = imageops::flip_vertical(&img);
    }
    if aug.rotate {
        img = match rng.random_range(0..4) {
            1 => imageops::rotate90(&img),
            2 => imageops::rotate180(&img),
            3 => imageops::rotate270(&img),
            _ => img,
        };
    }
    if aug.jpeg && rng.random_bool(0.5) {
        let quality = rng.random_range(50..=100u8);
        let bytes = JpegTileEncoder { quality }.encode_rgb(&img)?;
        img = decode_rgb(&bytes)?;
    }
    if aug.blur && rng.random_bool(0.1) {
        let sigma = rng.random_range(0.5f32..2.0);
        img = imageproc::filter::gaussian_blur_f32(&img, sigma);
    }
    Ok(img)
}

/// `img / 127.5 - 1`, laid out channel-major.
pub fn standardize(img: &RgbImage) -> DecodedImage {
    let (w, h) = img.dimensions();
    let plane = (w * h) as usize;
    let mut data = vec![0f32; 3 * plane];
    for (i, px) in img.pixels().enumerate() {
        for c in 0..3 {
            data[c * plane + i] = px[c] as f32 / 127.5 - 1.0;
        }
    }
    DecodedImage::Standardized { width: w, height: h, data }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::encode::PngTileEncoder;
    use crate::core::record::{build_index, Record, RecordWriter, CONTAINER_EXT};
    use std::collections::BTreeMap;

    fn container(dir: &Path, name: &str, n: usize) -> PathBuf {
        let path = dir.join(format!("{}.{}", name, CONTAINER_EXT));
        let mut w = RecordWriter::create(&path).unwrap();
        for i in 0..n {
            let img = RgbImage::from_pixel(8, 8, image::Rgb([255, (i * 10) as u8, 0]));
            let bytes = PngTileEncoder.encode_rgb(&img).unwrap();
            w.write(&Record { slide: name.into(), image_raw: bytes, loc_x: i as i64, loc_y: 7 }).unwrap();
        }
        w.finish().unwrap();
        build_index(&path).unwrap();
        path
    }

    fn counts(tiles: &[SampledTile]) -> BTreeMap<String, usize> {
        let mut out = BTreeMap::new();
        for t in tiles {
            *out.entry(t.slide.clone()).or_default() += 1;
        }
        out
    }

    fn collect(paths: &[PathBuf], opts: SamplerOptions) -> Vec<SampledTile> {
        TileSampler::new(paths, opts).unwrap().map(|t| t.unwrap()).collect()
    }

    #[test]
    fn test_finite_run_draws_every_record_once() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![container(dir.path(), "a", 5), container(dir.path(), "b", 3)];
        let opts = SamplerOptions { include_loc: true, num_threads: 2, chunk_size: 3, ..Default::default() };
        let tiles = collect(&paths, opts);
        let c = counts(&tiles);
        assert_eq!(c["a"], 5);
        assert_eq!(c["b"], 3);
        let mut locs: Vec<i64> = tiles.iter().filter(|t| t.slide == "a").map(|t| t.loc.unwrap().0).collect();
        locs.sort();
        assert_eq!(locs, vec![0, 1, 2, 3, 4]);
        assert!(tiles.iter().all(|t| t.image.dimensions() == (8, 8)));
    }

    #[test]
    fn test_clips_shards_and_zero_weights() {
        let dir = tempfile::tempdir().unwrap();
        let a = container(dir.path(), "a", 5);
        let b = container(dir.path(), "b", 3);
        let paths = vec![a.clone(), b.clone()];

        let mut clips = BTreeMap::new();
        clips.insert(a.clone(), 2);
        let c = counts(&collect(&paths, SamplerOptions { clips, ..Default::default() }));
        assert_eq!((c["a"], c["b"]), (2, 3));

        let c = counts(&collect(&paths, SamplerOptions { shard: (0, 2), ..Default::default() }));
        assert_eq!((c["a"], c["b"]), (3, 2));
        let c = counts(&collect(&paths, SamplerOptions { shard: (1, 2), ..Default::default() }));
        assert_eq!((c["a"], c["b"]), (2, 1));

        let mut weights = BTreeMap::new();
        weights.insert(a, 1.0);
        weights.insert(b, 0.0);
        let c = counts(&collect(&paths, SamplerOptions { weights: Some(weights), ..Default::default() }));
        assert_eq!(c.get("a"), Some(&5));
        assert_eq!(c.get("b"), None);
    }

    #[test]
    fn test_infinite_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![container(dir.path(), "a", 2), container(dir.path(), "b", 2)];
        let mut sampler = TileSampler::new(&paths, SamplerOptions { infinite: true, ..Default::default() }).unwrap();
        let tiles: Vec<SampledTile> = sampler.by_ref().take(40).map(|t| t.unwrap()).collect();
        assert_eq!(tiles.len(), 40);
        sampler.close();
        assert!(sampler.next().is_none());
    }

    #[test]
    fn test_missing_and_empty_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noindex.tfrecords");
        let mut w = RecordWriter::create(&path).unwrap();
        w.write(&Record { slide: "noindex".into(), image_raw: vec![1], loc_x: 0, loc_y: 0 }).unwrap();
        w.finish().unwrap();
        let err = TileSampler::new(&[path], SamplerOptions::default()).err().unwrap();
        assert!(err.to_string().contains("noindex.tfrecords"));

        let empty = container(dir.path(), "empty", 0);
        assert!(collect(&[empty], SamplerOptions::default()).is_empty());
    }

    #[test]
    fn test_labels_and_standardize() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![container(dir.path(), "a", 1)];
        let mut labels = HashMap::new();
        labels.insert("a".to_string(), Label::Categorical(1));
        let tiles = collect(&paths, SamplerOptions { labels, standardize: true, ..Default::default() });
        assert_eq!(tiles[0].label, Some(Label::Categorical(1)));
        assert_eq!(tiles[0].loc, None);
        match &tiles[0].image {
            DecodedImage::Standardized { width, height, data } => {
                assert_eq!((*width, *height), (8, 8));
                assert_eq!(data.len(), 3 * 64);
                assert!((data[0] - 1.0).abs() < 1e-6);
                assert!((data[64] + 1.0).abs() < 1e-6);
                assert!((data[128] + 1.0).abs() < 1e-6);
            }
            other => panic!("expected standardized image, got {:?}", other.dimensions()),
        }
    }

    #[test]
    fn test_augment_flags() {
        let aug: Augment = "xyrjb".parse().unwrap();
        assert!(aug.flip_x && aug.flip_y && aug.rotate && aug.jpeg && aug.blur);
        assert!("".parse::<Augment>().unwrap().is_none());
        assert!("xq".parse::<Augment>().is_err());

        let mut rng = StdRng::seed_from_u64(3);
        let img = RgbImage::from_fn(8, 4, |x, _| image::Rgb([x as u8 * 20, 0, 0]));
        for _ in 0..10 {
            let out = augment(img.clone(), aug, &mut rng).unwrap();
            let (w, h) = out.dimensions();
            assert!((w, h) == (8, 4) || (w, h) == (4, 8));
        }
    }
}
