//! Peak thumbnails built incrementally from WAV sources.
//!
//! [`ThumbnailProvider`] is the seam the renderer talks to. [`WavThumbnail`]
//! is the stock implementation: it decodes on a dedicated thread, publishes
//! min/max peaks every `samples_per_thumbnail_sample` frames and keeps a
//! running count of finished frames so the renderer can draw whatever is
//! ready.

use std::{
    collections::{hash_map::DefaultHasher, VecDeque},
    fmt,
    fs::File,
    hash::{Hash, Hasher},
    io::{BufReader, Cursor, Read},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
};

use image::{Rgb, RgbImage};

use crate::{
    raster::{self, PixelRect},
    source::AudioSource,
    Result,
};

/// Number of peaks accumulated locally before they are published.
const PUBLISH_EVERY_PEAKS: usize = 64;

/// Decoder-side collaborator of the renderer.
pub trait ThumbnailProvider: Send + Sync {
    /// Starts building a thumbnail for `source`, discarding the previous one.
    fn set_source(&self, source: Option<&AudioSource>);

    /// Frames decoded so far. Never decreases until the next `set_source`.
    fn finished_sample_count(&self) -> u64;

    fn is_fully_loaded(&self) -> bool;

    /// Draws one channel of `[start_time, end_time)` into `area` of `dest`.
    #[allow(clippy::too_many_arguments)]
    fn draw_channel(
        &self,
        dest: &mut RgbImage,
        area: PixelRect,
        start_time: f64,
        end_time: f64,
        channel: usize,
        vertical_zoom: f32,
        colour: Rgb<u8>,
    );
}

/// Min/max pairs per channel, one pair per `samples_per_peak` frames.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Peaks {
    pub sample_rate: u32,
    pub samples_per_peak: usize,
    /// Frames covered by the published peaks.
    pub num_frames: u64,
    pub channels: Vec<Vec<(f32, f32)>>,
}

impl Peaks {
    fn empty(samples_per_peak: usize) -> Self {
        Self {
            samples_per_peak,
            ..Default::default()
        }
    }

    pub fn num_peaks(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn draw(
        &self,
        dest: &mut RgbImage,
        area: PixelRect,
        start_time: f64,
        end_time: f64,
        channel: usize,
        vertical_zoom: f32,
        colour: Rgb<u8>,
    ) {
        let area = area.clipped_to(dest);
        let Some(peaks) = self.channels.get(channel) else {
            return;
        };
        if area.is_empty() || peaks.is_empty() || end_time <= start_time {
            return;
        }
        if self.sample_rate == 0 || self.samples_per_peak == 0 {
            return;
        }

        let peaks_per_second = f64::from(self.sample_rate) / self.samples_per_peak as f64;
        let seconds_per_column = (end_time - start_time) / f64::from(area.width);
        let half_height = (area.height as f32 - 1.0) * 0.5;
        let mid = area.y as f32 + half_height;

        for column in 0..area.width {
            let t0 = start_time + seconds_per_column * f64::from(column);
            let t1 = t0 + seconds_per_column;
            let first = (t0 * peaks_per_second).floor().max(0.0) as usize;
            if first >= peaks.len() {
                break;
            }
            let last = ((t1 * peaks_per_second).ceil() as usize)
                .max(first + 1)
                .min(peaks.len());

            let (low, high) = peaks[first..last]
                .iter()
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), (min, max)| {
                    (lo.min(*min), hi.max(*max))
                });
            let low = (low * vertical_zoom).clamp(-1.0, 1.0);
            let high = (high * vertical_zoom).clamp(-1.0, 1.0);

            let top = (mid - high * half_height).round().max(0.0) as u32;
            let bottom = (mid - low * half_height).round().max(0.0) as u32;
            raster::vertical_line(dest, area.x + column, top, bottom, colour);
        }
    }
}

/// Identity of a decoded source, used as the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceKey(u64);

impl SourceKey {
    /// Files are identified by path, size and modification time, memory
    /// blocks by their content.
    pub fn for_source(source: &AudioSource, samples_per_peak: usize) -> Self {
        let mut hasher = DefaultHasher::new();
        samples_per_peak.hash(&mut hasher);
        match source {
            AudioSource::File(path) => {
                path.hash(&mut hasher);
                if let Ok(metadata) = std::fs::metadata(path) {
                    metadata.len().hash(&mut hasher);
                    if let Ok(modified) = metadata.modified() {
                        modified.hash(&mut hasher);
                    }
                }
            }
            AudioSource::Memory(bytes) => bytes.hash(&mut hasher),
        }
        Self(hasher.finish())
    }
}

/// Keeps the most recently finished thumbnails so switching back to a
/// source does not decode it again.
pub struct ThumbnailCache {
    capacity: usize,
    entries: Mutex<VecDeque<(SourceKey, Arc<Peaks>)>>,
}

impl ThumbnailCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn get(&self, key: SourceKey) -> Option<Arc<Peaks>> {
        let mut entries = self.lock();
        let index = entries.iter().position(|(entry, _)| *entry == key)?;
        let hit = entries.remove(index)?;
        let peaks = hit.1.clone();
        entries.push_front(hit);
        Some(peaks)
    }

    pub fn insert(&self, key: SourceKey, peaks: Arc<Peaks>) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.lock();
        entries.retain(|(entry, _)| *entry != key);
        entries.push_front((key, peaks));
        entries.truncate(self.capacity);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<(SourceKey, Arc<Peaks>)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ThumbnailCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThumbnailCache")
            .field("capacity", &self.capacity)
            .field("entries", &self.len())
            .finish()
    }
}

struct DecodeShared {
    peaks: Mutex<Peaks>,
    finished: AtomicU64,
    fully_loaded: AtomicBool,
}

impl DecodeShared {
    fn peaks(&self) -> MutexGuard<'_, Peaks> {
        self.peaks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reset(&self, peaks: Peaks, fully_loaded: bool) {
        let finished = peaks.num_frames;
        *self.peaks() = peaks;
        self.finished.store(finished, Ordering::Release);
        self.fully_loaded.store(fully_loaded, Ordering::Release);
    }
}

struct DecodeJob {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl DecodeJob {
    fn cancel_and_join(self) {
        self.cancel.store(true, Ordering::Release);
        if self.handle.join().is_err() {
            tracing::warn!("thumbnail decode thread panicked");
        }
    }
}

/// Thumbnail provider that decodes WAV sources with `hound`.
pub struct WavThumbnail {
    samples_per_thumbnail_sample: usize,
    shared: Arc<DecodeShared>,
    cache: Option<Arc<ThumbnailCache>>,
    job: Mutex<Option<DecodeJob>>,
}

impl WavThumbnail {
    pub fn new(samples_per_thumbnail_sample: usize) -> Self {
        let samples_per_thumbnail_sample = samples_per_thumbnail_sample.max(1);
        Self {
            samples_per_thumbnail_sample,
            shared: Arc::new(DecodeShared {
                peaks: Mutex::new(Peaks::empty(samples_per_thumbnail_sample)),
                finished: AtomicU64::new(0),
                fully_loaded: AtomicBool::new(true),
            }),
            cache: None,
            job: Mutex::new(None),
        }
    }

    pub fn with_cache(samples_per_thumbnail_sample: usize, cache: Arc<ThumbnailCache>) -> Self {
        let mut thumbnail = Self::new(samples_per_thumbnail_sample);
        thumbnail.cache = Some(cache);
        thumbnail
    }

    /// Copy of the peaks published so far.
    pub fn peaks(&self) -> Peaks {
        self.shared.peaks().clone()
    }

    fn stop_job(&self) {
        let job = self
            .job
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(job) = job {
            job.cancel_and_join();
        }
    }

    fn start_job(&self, source: AudioSource) {
        let key = SourceKey::for_source(&source, self.samples_per_thumbnail_sample);
        if let Some(peaks) = self.cache.as_ref().and_then(|cache| cache.get(key)) {
            tracing::debug!(?source, "thumbnail served from cache");
            self.shared.reset(Peaks::clone(&peaks), true);
            return;
        }

        self.shared
            .reset(Peaks::empty(self.samples_per_thumbnail_sample), false);

        let cancel = Arc::new(AtomicBool::new(false));
        let worker = DecodeWorker {
            source,
            key,
            samples_per_peak: self.samples_per_thumbnail_sample,
            shared: self.shared.clone(),
            cache: self.cache.clone(),
            cancel: cancel.clone(),
        };

        match thread::Builder::new()
            .name("thumbnail-decode".into())
            .spawn(move || worker.run())
        {
            Ok(handle) => {
                *self.job.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(DecodeJob { cancel, handle });
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to spawn thumbnail decode thread");
                self.shared.fully_loaded.store(true, Ordering::Release);
            }
        }
    }
}

impl ThumbnailProvider for WavThumbnail {
    fn set_source(&self, source: Option<&AudioSource>) {
        self.stop_job();
        match source {
            Some(source) => self.start_job(source.clone()),
            None => self
                .shared
                .reset(Peaks::empty(self.samples_per_thumbnail_sample), true),
        }
    }

    fn finished_sample_count(&self) -> u64 {
        self.shared.finished.load(Ordering::Acquire)
    }

    fn is_fully_loaded(&self) -> bool {
        self.shared.fully_loaded.load(Ordering::Acquire)
    }

    fn draw_channel(
        &self,
        dest: &mut RgbImage,
        area: PixelRect,
        start_time: f64,
        end_time: f64,
        channel: usize,
        vertical_zoom: f32,
        colour: Rgb<u8>,
    ) {
        self.shared
            .peaks()
            .draw(dest, area, start_time, end_time, channel, vertical_zoom, colour);
    }
}

impl Drop for WavThumbnail {
    fn drop(&mut self) {
        self.stop_job();
    }
}

impl fmt::Debug for WavThumbnail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WavThumbnail")
            .field(
                "samples_per_thumbnail_sample",
                &self.samples_per_thumbnail_sample,
            )
            .field("finished", &self.finished_sample_count())
            .field("fully_loaded", &self.is_fully_loaded())
            .finish()
    }
}

struct DecodeWorker {
    source: AudioSource,
    key: SourceKey,
    samples_per_peak: usize,
    shared: Arc<DecodeShared>,
    cache: Option<Arc<ThumbnailCache>>,
    cancel: Arc<AtomicBool>,
}

impl DecodeWorker {
    fn run(self) {
        let result = match &self.source {
            AudioSource::File(path) => File::open(path)
                .map_err(Into::into)
                .and_then(|file| self.decode(BufReader::new(file))),
            AudioSource::Memory(bytes) => self.decode(Cursor::new(bytes.clone())),
        };

        match result {
            Ok(true) => {
                if let Some(cache) = &self.cache {
                    cache.insert(self.key, Arc::new(self.shared.peaks().clone()));
                }
                tracing::debug!(source = ?self.source, "thumbnail fully decoded");
            }
            Ok(false) => tracing::debug!(source = ?self.source, "thumbnail decode cancelled"),
            Err(err) => {
                tracing::warn!(source = ?self.source, error = %err, "thumbnail decode failed");
            }
        }

        if !self.cancel.load(Ordering::Acquire) {
            self.shared.fully_loaded.store(true, Ordering::Release);
        }
    }

    /// Returns `Ok(false)` when cancelled before the end of the stream.
    fn decode<R: Read>(&self, input: R) -> Result<bool> {
        let mut reader = hound::WavReader::new(input)?;
        let spec = reader.spec();
        let channels = usize::from(spec.channels.max(1));

        {
            let mut peaks = self.shared.peaks();
            peaks.sample_rate = spec.sample_rate;
            peaks.channels = vec![Vec::new(); channels];
        }

        let samples: Box<dyn Iterator<Item = hound::Result<f32>> + '_> = match spec.sample_format
        {
            hound::SampleFormat::Float => Box::new(reader.samples::<f32>()),
            hound::SampleFormat::Int => {
                let scale = (1_i64 << spec.bits_per_sample.saturating_sub(1)).max(1) as f32;
                Box::new(
                    reader
                        .samples::<i32>()
                        .map(move |sample| sample.map(|value| value as f32 / scale)),
                )
            }
        };

        let mut accumulator = PeakAccumulator::new(channels, self.samples_per_peak);
        let mut pending: Vec<Vec<(f32, f32)>> = vec![Vec::new(); channels];
        let mut failure = None;

        for (index, sample) in samples.enumerate() {
            let sample = match sample {
                Ok(sample) => sample,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            };
            if let Some(peak) = accumulator.push(index % channels, sample) {
                for (channel, pair) in peak.into_iter().enumerate() {
                    pending[channel].push(pair);
                }
                if pending[0].len() >= PUBLISH_EVERY_PEAKS {
                    if self.cancel.load(Ordering::Acquire) {
                        return Ok(false);
                    }
                    self.publish(&mut pending, accumulator.frames_in_peaks());
                }
            }
        }

        if let Some(peak) = accumulator.flush() {
            for (channel, pair) in peak.into_iter().enumerate() {
                pending[channel].push(pair);
            }
        }
        self.publish(&mut pending, accumulator.frames_in_peaks());

        match failure {
            Some(err) => Err(err.into()),
            None => Ok(true),
        }
    }

    fn publish(&self, pending: &mut [Vec<(f32, f32)>], frames: u64) {
        let mut peaks = self.shared.peaks();
        for (target, fresh) in peaks.channels.iter_mut().zip(pending.iter_mut()) {
            target.append(fresh);
        }
        peaks.num_frames = frames;
        self.shared.finished.store(frames, Ordering::Release);
    }
}

/// Folds interleaved samples into per-channel min/max bins.
struct PeakAccumulator {
    samples_per_peak: usize,
    minimums: Vec<f32>,
    maximums: Vec<f32>,
    frames_in_bin: usize,
    frames: u64,
    frames_in_peaks: u64,
}

impl PeakAccumulator {
    fn new(channels: usize, samples_per_peak: usize) -> Self {
        Self {
            samples_per_peak: samples_per_peak.max(1),
            minimums: vec![f32::INFINITY; channels],
            maximums: vec![f32::NEG_INFINITY; channels],
            frames_in_bin: 0,
            frames: 0,
            frames_in_peaks: 0,
        }
    }

    /// Frames covered by the bins emitted so far.
    fn frames_in_peaks(&self) -> u64 {
        self.frames_in_peaks
    }

    fn push(&mut self, channel: usize, sample: f32) -> Option<Vec<(f32, f32)>> {
        self.minimums[channel] = self.minimums[channel].min(sample);
        self.maximums[channel] = self.maximums[channel].max(sample);

        if channel + 1 < self.minimums.len() {
            return None;
        }
        self.frames += 1;
        self.frames_in_bin += 1;
        if self.frames_in_bin < self.samples_per_peak {
            return None;
        }
        Some(self.take_bin())
    }

    /// Emits the trailing partial bin, if any frames are in it.
    fn flush(&mut self) -> Option<Vec<(f32, f32)>> {
        if self.frames_in_bin == 0 {
            return None;
        }
        Some(self.take_bin())
    }

    fn take_bin(&mut self) -> Vec<(f32, f32)> {
        self.frames_in_bin = 0;
        self.frames_in_peaks = self.frames;
        let bin = self
            .minimums
            .iter()
            .zip(&self.maximums)
            .map(|(min, max)| {
                if min.is_finite() && max.is_finite() {
                    (*min, *max)
                } else {
                    (0.0, 0.0)
                }
            })
            .collect();
        self.minimums.fill(f32::INFINITY);
        self.maximums.fill(f32::NEG_INFINITY);
        bin
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::source::wav_bytes;

    fn wait_until_loaded(thumbnail: &WavThumbnail) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !thumbnail.is_fully_loaded() {
            assert!(Instant::now() < deadline, "decode did not finish in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn ramp(len: usize) -> Vec<i16> {
        (0..len).map(|i| ((i % 200) as i16 - 100) * 100).collect()
    }

    #[test]
    fn accumulator_tracks_each_channel() {
        let mut accumulator = PeakAccumulator::new(2, 2);
        assert!(accumulator.push(0, 0.5).is_none());
        assert!(accumulator.push(1, -0.5).is_none());
        assert!(accumulator.push(0, -0.25).is_none());
        let bin = accumulator.push(1, 0.75).expect("second frame closes the bin");

        assert_eq!(bin, vec![(-0.25, 0.5), (-0.5, 0.75)]);
        assert_eq!(accumulator.frames_in_peaks(), 2);

        accumulator.push(0, 0.1);
        accumulator.push(1, 0.2);
        assert_eq!(accumulator.flush(), Some(vec![(0.1, 0.1), (0.2, 0.2)]));
        assert_eq!(accumulator.frames_in_peaks(), 3);
        assert_eq!(accumulator.flush(), None);
    }

    #[test]
    fn decodes_memory_block_incrementally_to_completion() {
        let samples = ramp(20_000);
        let bytes = wav_bytes(8_000, 1, &samples);
        let thumbnail = WavThumbnail::new(100);

        thumbnail.set_source(Some(&AudioSource::Memory(bytes.into())));
        wait_until_loaded(&thumbnail);

        assert_eq!(thumbnail.finished_sample_count(), 20_000);
        let peaks = thumbnail.peaks();
        assert_eq!(peaks.sample_rate, 8_000);
        assert_eq!(peaks.num_peaks(), 200);
        let (min, max) = peaks.channels[0][0];
        assert!((min - (-10_000.0 / 32_768.0)).abs() < 1e-4);
        assert!((max - (-100.0 / 32_768.0)).abs() < 1e-4);
    }

    #[test]
    fn trailing_partial_bin_is_kept() {
        let bytes = wav_bytes(1_000, 2, &[1_000; 2 * 250]);
        let thumbnail = WavThumbnail::new(100);

        thumbnail.set_source(Some(&AudioSource::Memory(bytes.into())));
        wait_until_loaded(&thumbnail);

        assert_eq!(thumbnail.finished_sample_count(), 250);
        let peaks = thumbnail.peaks();
        assert_eq!(peaks.channels.len(), 2);
        assert_eq!(peaks.num_peaks(), 3);
    }

    #[test]
    fn clearing_the_source_resets_progress() {
        let thumbnail = WavThumbnail::new(64);
        thumbnail.set_source(Some(&AudioSource::Memory(
            wav_bytes(8_000, 1, &ramp(4_000)).into(),
        )));
        wait_until_loaded(&thumbnail);

        thumbnail.set_source(None);
        assert!(thumbnail.is_fully_loaded());
        assert_eq!(thumbnail.finished_sample_count(), 0);
        assert_eq!(thumbnail.peaks().num_peaks(), 0);
    }

    #[test]
    fn unreadable_sources_finish_empty() {
        let thumbnail = WavThumbnail::new(64);
        thumbnail.set_source(Some(&AudioSource::Memory(vec![0_u8; 12].into())));
        wait_until_loaded(&thumbnail);
        assert_eq!(thumbnail.finished_sample_count(), 0);

        thumbnail.set_source(Some(&AudioSource::File("/definitely/not/here.wav".into())));
        wait_until_loaded(&thumbnail);
        assert_eq!(thumbnail.finished_sample_count(), 0);
    }

    #[test]
    fn cache_serves_repeat_sources() {
        let cache = Arc::new(ThumbnailCache::new(3));
        let source = AudioSource::Memory(wav_bytes(8_000, 1, &ramp(8_000)).into());

        let first = WavThumbnail::with_cache(128, cache.clone());
        first.set_source(Some(&source));
        wait_until_loaded(&first);
        assert_eq!(cache.len(), 1);

        let second = WavThumbnail::with_cache(128, cache.clone());
        second.set_source(Some(&source));
        assert!(second.is_fully_loaded());
        assert_eq!(second.finished_sample_count(), 8_000);
        assert_eq!(second.peaks(), first.peaks());
    }

    #[test]
    fn cache_evicts_least_recently_used() {
        let cache = ThumbnailCache::new(2);
        let keys: Vec<SourceKey> = (0..3_u8)
            .map(|i| SourceKey::for_source(&AudioSource::Memory(vec![i].into()), 1))
            .collect();

        cache.insert(keys[0], Arc::new(Peaks::empty(1)));
        cache.insert(keys[1], Arc::new(Peaks::empty(1)));
        assert!(cache.get(keys[0]).is_some());
        cache.insert(keys[2], Arc::new(Peaks::empty(1)));

        assert!(cache.get(keys[0]).is_some());
        assert!(cache.get(keys[1]).is_none());
        assert!(cache.get(keys[2]).is_some());
    }

    #[test]
    fn draw_fills_columns_between_min_and_max() {
        let peaks = Peaks {
            sample_rate: 10,
            samples_per_peak: 1,
            num_frames: 4,
            channels: vec![vec![(-1.0, 1.0), (0.0, 0.0), (-1.0, 1.0), (0.0, 0.0)]],
        };
        let mut image = raster::blank(4, 11);

        peaks.draw(
            &mut image,
            PixelRect::new(0, 0, 4, 11),
            0.0,
            0.4,
            0,
            1.0,
            raster::WAVEFORM,
        );

        let lit = |x: u32| (0..11).filter(|y| *image.get_pixel(x, *y) == raster::WAVEFORM).count();
        assert_eq!(lit(0), 11);
        assert_eq!(lit(1), 1);
        assert_eq!(lit(2), 11);
        assert_eq!(*image.get_pixel(1, 5), raster::WAVEFORM);
    }

    #[test]
    fn draw_stops_where_decoded_data_ends() {
        let peaks = Peaks {
            sample_rate: 10,
            samples_per_peak: 1,
            num_frames: 2,
            channels: vec![vec![(-0.5, 0.5), (-0.5, 0.5)]],
        };
        let mut image = raster::blank(4, 5);
        peaks.draw(&mut image, PixelRect::new(0, 0, 4, 5), 0.0, 0.4, 0, 1.0, raster::WAVEFORM);

        assert_eq!(*image.get_pixel(1, 2), raster::WAVEFORM);
        assert!((0..5).all(|y| *image.get_pixel(3, y) == raster::BACKGROUND));
    }
}
