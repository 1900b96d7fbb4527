//! Core library for the waveform thumbnail renderer.
//!
//! A [`SourceMonitor`] holds the current audio source, a [`WavThumbnail`]
//! decodes it into min/max peaks on its own thread, and a [`ThumbnailImage`]
//! turns the decoded prefix into pixels a little at a time on a shared
//! [`TimeSliceThread`]. The owner thread polls the image's repaint timer to
//! hear about progress.

pub mod config;
pub mod error;
pub mod listeners;
pub mod raster;
pub mod renderer;
pub mod scheduler;
pub mod source;
pub mod thumbnail;
pub mod timer;

pub use config::{AppConfig, SchedulerConfig, ThumbnailConfig};
pub use error::{Result, ThumbnailError};
pub use listeners::{ListenerId, ListenerList};
pub use raster::PixelRect;
pub use renderer::{SliceSpan, ThumbnailImage, ThumbnailListener};
pub use scheduler::{ClientId, SliceOutcome, TimeSliceClient, TimeSliceThread};
pub use source::{AudioSource, LoadedSource, SourceInfo, SourceListener, SourceMonitor};
pub use thumbnail::{Peaks, SourceKey, ThumbnailCache, ThumbnailProvider, WavThumbnail};
pub use timer::RepaintTimer;
