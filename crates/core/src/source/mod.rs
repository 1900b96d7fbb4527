use std::{
    fmt,
    fs::File,
    io::{BufReader, Cursor},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, Weak},
};

use serde::{Deserialize, Serialize};

use crate::{
    listeners::{ListenerId, ListenerList},
    Result, ThumbnailError,
};

/// Where the monitored audio comes from.
#[derive(Clone, PartialEq, Eq)]
pub enum AudioSource {
    File(PathBuf),
    Memory(Arc<[u8]>),
}

impl AudioSource {
    /// Reads the WAV header and returns the stream layout.
    ///
    /// The header's length is trusted only as far as the underlying bytes
    /// could hold that many frames.
    pub fn probe(&self) -> Result<SourceInfo> {
        let (spec, frames, total_bytes) = match self {
            Self::File(path) => {
                let file = File::open(path)?;
                let total_bytes = file.metadata()?.len();
                let reader = hound::WavReader::new(BufReader::new(file))?;
                (reader.spec(), reader.duration(), total_bytes)
            }
            Self::Memory(bytes) => {
                let reader = hound::WavReader::new(Cursor::new(bytes.clone()))?;
                (reader.spec(), reader.duration(), bytes.len() as u64)
            }
        };

        let bytes_per_frame =
            u64::from(spec.bits_per_sample.div_ceil(8)).max(1) * u64::from(spec.channels.max(1));
        Ok(SourceInfo {
            sample_rate: spec.sample_rate,
            num_channels: spec.channels,
            length_in_samples: u64::from(frames).min(total_bytes / bytes_per_frame),
        })
    }
}

impl fmt::Debug for AudioSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Memory(bytes) => f.debug_tuple("Memory").field(&bytes.len()).finish(),
        }
    }
}

/// Layout of a source as reported by its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub sample_rate: u32,
    pub num_channels: u16,
    /// Length in frames (samples per channel).
    pub length_in_samples: u64,
}

impl SourceInfo {
    pub fn length_in_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.length_in_samples as f64 / f64::from(self.sample_rate)
    }

    /// Whether a thumbnail can be drawn for this source at all.
    pub fn is_renderable(&self) -> bool {
        self.sample_rate > 0 && self.length_in_samples > 0
    }
}

/// A source together with its probed layout.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedSource {
    pub source: AudioSource,
    pub info: SourceInfo,
}

impl LoadedSource {
    pub fn new(source: AudioSource, info: SourceInfo) -> Self {
        Self { source, info }
    }
}

/// Receives notifications whenever the monitored source is swapped.
pub trait SourceListener: Send + Sync {
    /// `None` means there is no usable source any more.
    fn source_changed(&self, source: Option<&LoadedSource>);
}

/// Shared handle tracking the current audio source of a player.
///
/// Cloning the monitor yields another handle onto the same source and
/// listener set.
#[derive(Clone, Default)]
pub struct SourceMonitor {
    shared: Arc<MonitorShared>,
}

#[derive(Default)]
struct MonitorShared {
    current: Mutex<Option<LoadedSource>>,
    listeners: ListenerList<dyn SourceListener>,
}

impl SourceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switches to a WAV file on disk.
    ///
    /// A file that cannot be read still counts as a change: the monitor is
    /// cleared, listeners hear about it, and the error is returned.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<SourceInfo> {
        self.load(AudioSource::File(path.as_ref().to_path_buf()))
    }

    /// Switches to an in-memory WAV block.
    pub fn load_memory(&self, bytes: impl Into<Arc<[u8]>>) -> Result<SourceInfo> {
        self.load(AudioSource::Memory(bytes.into()))
    }

    /// Drops the current source.
    pub fn clear(&self) -> Result<()> {
        self.replace(None)
    }

    pub fn current(&self) -> Result<Option<LoadedSource>> {
        Ok(self.lock()?.clone())
    }

    pub fn add_listener<L: SourceListener + 'static>(&self, listener: &Arc<L>) -> ListenerId {
        let weak = Arc::downgrade(listener);
        let weak: Weak<dyn SourceListener> = weak;
        self.shared.listeners.add(weak)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove(id)
    }

    fn load(&self, source: AudioSource) -> Result<SourceInfo> {
        match source.probe() {
            Ok(info) => {
                tracing::info!(?source, ?info, "audio source changed");
                self.replace(Some(LoadedSource::new(source, info)))?;
                Ok(info)
            }
            Err(err) => {
                tracing::warn!(?source, error = %err, "audio source is unreadable");
                self.replace(None)?;
                Err(err)
            }
        }
    }

    fn replace(&self, next: Option<LoadedSource>) -> Result<()> {
        *self.lock()? = next.clone();
        self.shared
            .listeners
            .call(|listener| listener.source_changed(next.as_ref()));
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<LoadedSource>>> {
        self.shared
            .current
            .lock()
            .map_err(|_| ThumbnailError::msg("source monitor has been poisoned"))
    }
}

impl fmt::Debug for SourceMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceMonitor")
            .field("listeners", &self.shared.listeners)
            .finish()
    }
}

/// Encodes interleaved 16-bit samples as an in-memory WAV file.
#[cfg(test)]
pub(crate) fn wav_bytes(sample_rate: u32, channels: u16, samples: &[i16]) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for sample in samples {
            writer.write_sample(*sample).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

/// A short WAV block whose `data` chunk claims almost 4 GiB.
#[cfg(test)]
pub(crate) fn lying_header_bytes() -> Vec<u8> {
    let mut bytes = wav_bytes(44_100, 1, &[0; 4]);
    let data = bytes
        .windows(4)
        .position(|window| window == b"data")
        .unwrap();
    bytes[data + 4..data + 8].copy_from_slice(&0xFFFF_FFF0_u32.to_le_bytes());
    bytes
}
