//! Waveform image that fills in while its source is still being decoded.
//!
//! A [`ThumbnailImage`] listens to a [`SourceMonitor`]. When the source
//! changes it allocates a fresh image sized by the source length and
//! registers itself with a shared [`TimeSliceThread`]. Every background slice
//! asks the [`ThumbnailProvider`] how much audio is ready, rasterises the new
//! span at an oversampled width into a scratch buffer and scales it into the
//! persistent image. A [`RepaintTimer`] polled by the owner thread turns that
//! progress into listener notifications.
//!
//! Image, render cursor and completion flag are only mutated under the state
//! mutex, so control calls on the owner thread wait for an in-flight slice
//! to return before they touch anything.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak,
    },
    time::Instant,
};

use image::RgbImage;

use crate::{
    config::ThumbnailConfig,
    listeners::{ListenerId, ListenerList},
    raster::{self, PixelRect},
    scheduler::{ClientId, SliceOutcome, TimeSliceClient, TimeSliceThread},
    source::{LoadedSource, SourceInfo, SourceListener, SourceMonitor},
    thumbnail::ThumbnailProvider,
    timer::RepaintTimer,
    Result, ThumbnailError,
};

/// Callbacks fired on the owner thread while a thumbnail is being built.
pub trait ThumbnailListener: Send + Sync {
    /// The source was swapped and the previous image discarded.
    fn image_changed(&self, _image: &ThumbnailImage) {}

    /// New pixels may have been committed; a repaint is worthwhile.
    fn image_updated(&self, _image: &ThumbnailImage) {}

    /// Rendering finished. No further updates until the next source change.
    fn image_finished(&self, _image: &ThumbnailImage) {}
}

/// Time range rasterised by one render pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SliceSpan {
    pub start_time: f64,
    pub end_time: f64,
}

impl SliceSpan {
    /// When more has already been drawn than is new, the start is pulled back
    /// by half of the new span so that chunk boundaries are drawn twice.
    pub fn plan(last_time_drawn: f64, end_time: f64) -> Self {
        let time_to_draw = end_time - last_time_drawn;
        let start_time = if last_time_drawn > time_to_draw {
            last_time_drawn - time_to_draw * 0.5
        } else {
            last_time_drawn
        };

        Self {
            start_time,
            end_time,
        }
    }

    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }
}

/// Maps a time offset (or duration) onto image columns.
pub fn time_to_pixel(time: f64, length_seconds: f64, image_width: u32) -> i64 {
    if length_seconds.is_nan() || length_seconds <= 0.0 {
        return 0;
    }
    (time / length_seconds * f64::from(image_width)).round() as i64
}

/// Widest waveform image the renderer allocates. Longer sources are treated
/// as not renderable.
pub const MAX_IMAGE_WIDTH: u32 = 1 << 18;

/// Width of the waveform image for a source: one column per thumbnail
/// sample, at least one.
pub fn image_width_for(info: &SourceInfo, samples_per_thumbnail_sample: usize) -> u32 {
    let columns = info.length_in_samples / samples_per_thumbnail_sample.max(1) as u64;
    u32::try_from(columns).unwrap_or(u32::MAX).max(1)
}

struct RenderState {
    image: RgbImage,
    scratch: RgbImage,
    last_time_drawn: f64,
    resolution: f64,
    sample_rate: f64,
    length_seconds: f64,
}

impl RenderState {
    fn new(config: &ThumbnailConfig) -> Self {
        Self {
            image: raster::blank(1, config.image_height),
            scratch: RgbImage::new(0, 0),
            last_time_drawn: 0.0,
            resolution: config.resolution,
            sample_rate: 0.0,
            length_seconds: 0.0,
        }
    }

    fn reset_for(&mut self, info: &SourceInfo, config: &ThumbnailConfig) {
        let width = image_width_for(info, config.samples_per_thumbnail_sample);
        self.image = raster::blank(width, config.image_height);
        self.last_time_drawn = 0.0;
        self.sample_rate = f64::from(info.sample_rate);
        self.length_seconds = info.length_in_seconds();
    }

    fn reset_empty(&mut self, height: u32) {
        self.image = raster::blank(1, height);
        self.last_time_drawn = 0.0;
        self.sample_rate = 0.0;
        self.length_seconds = 0.0;
    }

    fn has_source(&self) -> bool {
        self.sample_rate > 0.0 && self.length_seconds > 0.0
    }

    /// Draws whatever the provider finished since the last pass. Returns
    /// whether any pixels were committed.
    fn render_pass(&mut self, provider: &dyn ThumbnailProvider) -> bool {
        let finished = provider.finished_sample_count();
        if finished == 0 || !self.has_source() {
            return false;
        }

        let end_time = (finished as f64 / self.sample_rate).min(self.length_seconds);
        let span = SliceSpan::plan(self.last_time_drawn, end_time);
        self.last_time_drawn = span.start_time;

        let width = self.image.width();
        let height = self.image.height();
        let start_x = time_to_pixel(span.start_time, self.length_seconds, width)
            .clamp(0, i64::from(width)) as u32;
        let num_pixels = time_to_pixel(span.duration(), self.length_seconds, width)
            .clamp(0, i64::from(width - start_x)) as u32;
        let num_scratch_pixels = (f64::from(num_pixels) * self.resolution).round() as u32;
        if num_pixels == 0 || num_scratch_pixels == 0 {
            return false;
        }

        if self.scratch.width() < num_scratch_pixels || self.scratch.height() != height {
            self.scratch = raster::blank(num_scratch_pixels.max(self.scratch.width()), height);
        } else {
            raster::clear(&mut self.scratch);
        }

        provider.draw_channel(
            &mut self.scratch,
            PixelRect::new(0, 0, num_scratch_pixels, height),
            span.start_time,
            span.end_time,
            0,
            1.0,
            raster::WAVEFORM,
        );
        self.last_time_drawn = span.end_time;

        raster::composite_scaled(
            &mut self.image,
            start_x,
            num_pixels,
            &self.scratch,
            num_scratch_pixels,
        );

        tracing::debug!(
            start = span.start_time,
            end = span.end_time,
            start_x,
            num_pixels,
            "committed waveform section"
        );
        true
    }
}

/// Incrementally rendered waveform image of the monitored source.
pub struct ThumbnailImage {
    me: Weak<ThumbnailImage>,
    config: ThumbnailConfig,
    monitor: SourceMonitor,
    source_listener: OnceLock<ListenerId>,
    thread: Arc<TimeSliceThread>,
    provider: Arc<dyn ThumbnailProvider>,
    state: Mutex<RenderState>,
    render_complete: AtomicBool,
    client: Mutex<Option<ClientId>>,
    timer: Mutex<RepaintTimer>,
    listeners: ListenerList<dyn ThumbnailListener>,
}

impl ThumbnailImage {
    /// Creates a renderer attached to `monitor`. A source already present in
    /// the monitor is picked up straight away.
    pub fn new(
        monitor: &SourceMonitor,
        thread: Arc<TimeSliceThread>,
        provider: Arc<dyn ThumbnailProvider>,
        config: ThumbnailConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let image = Arc::new_cyclic(|me: &Weak<Self>| Self {
            me: me.clone(),
            state: Mutex::new(RenderState::new(&config)),
            config,
            monitor: monitor.clone(),
            source_listener: OnceLock::new(),
            thread,
            provider,
            render_complete: AtomicBool::new(true),
            client: Mutex::new(None),
            timer: Mutex::new(RepaintTimer::new()),
            listeners: ListenerList::new(),
        });

        // Registered once the Arc is live so dispatch never sees a dead entry.
        let source_listener = monitor.add_listener(&image);
        let _ = image.source_listener.set(source_listener);

        if let Some(loaded) = monitor.current()? {
            image.handle_source(Some(&loaded))?;
        }
        Ok(image)
    }

    /// The slice of the waveform covering `[start_time, start_time + duration)`.
    ///
    /// The returned image is a copy of the pixels committed so far; requests
    /// outside the source or with a non-positive duration yield an empty
    /// image.
    pub fn image_at_time(&self, start_time: f64, duration: f64) -> Result<RgbImage> {
        let state = self.lock_state()?;
        if duration.is_nan() || duration <= 0.0 || !state.has_source() {
            return Ok(RgbImage::new(0, 0));
        }

        let width = state.image.width();
        let start_x = time_to_pixel(start_time, state.length_seconds, width);
        let num_pixels = time_to_pixel(duration, state.length_seconds, width);
        Ok(raster::crop_columns(&state.image, start_x, num_pixels))
    }

    /// Copy of the whole waveform image.
    pub fn full_image(&self) -> Result<RgbImage> {
        Ok(self.lock_state()?.image.clone())
    }

    pub fn image_size(&self) -> Result<(u32, u32)> {
        Ok(self.lock_state()?.image.dimensions())
    }

    /// Changes the oversampling factor. The image is cleared and redrawn
    /// from the start.
    pub fn set_resolution(&self, resolution: f64) -> Result<()> {
        if !(resolution.is_finite() && resolution > 0.0) {
            return Err(ThumbnailError::InvalidInput(
                "resolution must be a positive number",
            ));
        }

        let rerender = {
            let mut state = self.lock_state()?;
            state.resolution = resolution;
            raster::clear(&mut state.image);
            state.last_time_drawn = 0.0;
            let rerender = state.has_source();
            if rerender {
                self.render_complete.store(false, Ordering::Release);
            }
            rerender
        };

        tracing::debug!(resolution, rerender, "thumbnail resolution changed");
        if rerender {
            self.schedule()?;
        }
        Ok(())
    }

    pub fn resolution(&self) -> Result<f64> {
        Ok(self.lock_state()?.resolution)
    }

    /// Seconds of the source committed to the image so far.
    pub fn last_time_drawn(&self) -> Result<f64> {
        Ok(self.lock_state()?.last_time_drawn)
    }

    pub fn is_render_complete(&self) -> bool {
        self.render_complete.load(Ordering::Acquire)
    }

    pub fn is_timer_running(&self) -> bool {
        self.timer().is_running()
    }

    pub fn add_listener<L: ThumbnailListener + 'static>(&self, listener: &Arc<L>) -> ListenerId {
        let weak = Arc::downgrade(listener);
        let weak: Weak<dyn ThumbnailListener> = weak;
        self.listeners.add(weak)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Drives the repaint timer; call this regularly from the owner thread.
    /// Returns whether the timer fired.
    pub fn poll_timer(&self, now: Instant) -> bool {
        let due = self.timer().poll(now);
        if due {
            self.tick();
        }
        due
    }

    /// Body of the repaint timer.
    pub fn tick(&self) {
        let complete = self.is_render_complete();
        self.listeners.call(|listener| listener.image_updated(self));

        if complete {
            // Stopped first: a finished listener may start a new render.
            self.timer().stop();
            tracing::debug!("thumbnail timer stopped");
            self.listeners.call(|listener| listener.image_finished(self));
        }
    }

    fn handle_source(&self, source: Option<&LoadedSource>) -> Result<()> {
        let samples_per_column = self.config.samples_per_thumbnail_sample;
        let renderable = source.filter(|loaded| {
            loaded.info.is_renderable()
                && image_width_for(&loaded.info, samples_per_column) <= MAX_IMAGE_WIDTH
        });

        {
            let mut state = self.lock_state()?;
            match renderable {
                Some(loaded) => {
                    state.reset_for(&loaded.info, &self.config);
                    self.provider.set_source(Some(&loaded.source));
                    self.render_complete.store(false, Ordering::Release);
                    tracing::info!(
                        source = ?loaded.source,
                        width = state.image.width(),
                        seconds = state.length_seconds,
                        "rendering thumbnail"
                    );
                }
                None => {
                    state.reset_empty(self.config.image_height);
                    self.provider.set_source(None);
                    self.render_complete.store(true, Ordering::Release);
                    tracing::info!("no renderable source, thumbnail left empty");
                }
            }
        }

        self.schedule()?;
        self.listeners.call(|listener| listener.image_changed(self));
        Ok(())
    }

    fn schedule(&self) -> Result<()> {
        let client: Weak<dyn TimeSliceClient> = self.me.clone();
        let id = self.thread.add_client(client);
        *self.lock_client()? = Some(id);
        self.thread.ensure_running()?;
        self.timer().start(self.config.timer_interval());
        Ok(())
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, RenderState>> {
        self.state
            .lock()
            .map_err(|_| ThumbnailError::msg("thumbnail render state has been poisoned"))
    }

    fn lock_client(&self) -> Result<MutexGuard<'_, Option<ClientId>>> {
        self.client
            .lock()
            .map_err(|_| ThumbnailError::msg("thumbnail client slot has been poisoned"))
    }

    fn timer(&self) -> MutexGuard<'_, RepaintTimer> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SourceListener for ThumbnailImage {
    fn source_changed(&self, source: Option<&LoadedSource>) {
        if let Err(err) = self.handle_source(source) {
            tracing::warn!(error = %err, "failed to switch thumbnail source");
        }
    }
}

impl TimeSliceClient for ThumbnailImage {
    fn use_time_slice(&self) -> SliceOutcome {
        let mut state = match self.lock_state() {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(error = %err, "dropping thumbnail from background thread");
                return SliceOutcome::Finished;
            }
        };
        if self.is_render_complete() {
            return SliceOutcome::Finished;
        }

        // Sampled before the pass: if the decoder was already done, the
        // count read inside the pass is final.
        let fully_loaded = self.provider.is_fully_loaded();
        state.render_pass(self.provider.as_ref());

        if fully_loaded {
            self.render_complete.store(true, Ordering::Release);
            tracing::info!(seconds = state.last_time_drawn, "thumbnail render complete");
            return SliceOutcome::Finished;
        }
        SliceOutcome::RunAgainAfter(self.config.slice_interval())
    }
}

impl Drop for ThumbnailImage {
    fn drop(&mut self) {
        if let Some(id) = self.source_listener.get() {
            self.monitor.remove_listener(*id);
        }
        let client = self
            .client
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = client {
            self.thread.remove_client(id);
        }
        self.timer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .stop();
    }
}

impl fmt::Debug for ThumbnailImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThumbnailImage")
            .field("config", &self.config)
            .field("render_complete", &self.is_render_complete())
            .field("listeners", &self.listeners)
            .finish()
    }
}
