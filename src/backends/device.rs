//! Audio outputs and the devices that open them.
//!
//! An [`AudioOutput`] is the producer half of a bounded chunk queue; the matching
//! [`AudioStream`] is what a device plays from. The bound is the backpressure signal:
//! when the device lags, the queue fills and the producing engine waits on
//! [`AudioOutput::reserve`] instead of dropping or overwriting chunks.
//!
//! ## Devices
//! - [`NullDevice`] drains each stream on its own thread at real-time pace and discards the samples.
//! - [`ChannelDevice`] hands each opened stream to a consumer (tests, custom sinks).

use std::thread;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::config::AudioFormat;
use crate::error::EngineError;
use crate::identity::Identity;

/// Producer half of a bounded chunk queue.
#[derive(Debug, Clone)]
pub struct AudioOutput {
    tx: mpsc::Sender<Vec<f32>>,
}

impl AudioOutput {
    /// Creates a queue holding at most `capacity` chunks (min 1).
    pub fn channel(capacity: usize) -> (AudioOutput, AudioStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (AudioOutput { tx }, AudioStream { rx })
    }

    /// Reserves a slot without waiting.
    ///
    /// `Ok(None)` means the queue is full (the device is behind).
    pub fn try_reserve(&self) -> Result<Option<mpsc::Permit<'_, Vec<f32>>>, EngineError> {
        match self.tx.try_reserve() {
            Ok(permit) => Ok(Some(permit)),
            Err(mpsc::error::TrySendError::Full(())) => Ok(None),
            Err(mpsc::error::TrySendError::Closed(())) => Err(closed()),
        }
    }

    /// Waits for a free slot. Cancel-safe: dropping the future loses nothing.
    pub async fn reserve(&self) -> Result<mpsc::Permit<'_, Vec<f32>>, EngineError> {
        self.tx.reserve().await.map_err(|_| closed())
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

fn closed() -> EngineError {
    EngineError::Device("audio stream closed by device".to_string())
}

/// Consumer half of a bounded chunk queue.
#[derive(Debug)]
pub struct AudioStream {
    rx: mpsc::Receiver<Vec<f32>>,
}

impl AudioStream {
    /// Next chunk; `None` once the producer is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<Vec<f32>> {
        self.rx.recv().await
    }

    /// Next chunk if one is queued.
    pub fn try_recv(&mut self) -> Result<Vec<f32>, TryRecvError> {
        self.rx.try_recv()
    }

    /// Blocking receive for device threads. Must not be called from async context.
    pub fn blocking_recv(&mut self) -> Option<Vec<f32>> {
        self.rx.blocking_recv()
    }
}

/// Something that can play interleaved `f32` chunks.
pub trait AudioDevice: Send + Sync + 'static {
    /// Opens a stream for instance `id`, buffering at most `capacity` chunks.
    fn open(&self, id: Identity, format: &AudioFormat, capacity: usize) -> Result<AudioOutput, EngineError>;
}

/// Discards audio at real-time pace.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDevice;

impl AudioDevice for NullDevice {
    fn open(&self, id: Identity, format: &AudioFormat, capacity: usize) -> Result<AudioOutput, EngineError> {
        let (output, mut stream) = AudioOutput::channel(capacity);
        let pace = format.chunk_duration();
        thread::Builder::new()
            .name(format!("livevisor-audio-{id}"))
            .spawn(move || {
                while stream.blocking_recv().is_some() {
                    thread::sleep(pace);
                }
            })?;
        Ok(output)
    }
}

/// Hands every opened stream to a consumer.
#[derive(Debug, Clone)]
pub struct ChannelDevice {
    streams: mpsc::UnboundedSender<(Identity, AudioStream)>,
}

impl ChannelDevice {
    /// Returns the device and the receiver of `(instance, stream)` pairs.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(Identity, AudioStream)>) {
        let (streams, rx) = mpsc::unbounded_channel();
        (Self { streams }, rx)
    }
}

impl AudioDevice for ChannelDevice {
    fn open(&self, id: Identity, _format: &AudioFormat, capacity: usize) -> Result<AudioOutput, EngineError> {
        let (output, stream) = AudioOutput::channel(capacity);
        self.streams
            .send((id, stream))
            .map_err(|_| EngineError::Device("no consumer attached to channel device".to_string()))?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_output_reports_full_queue() {
        let (out, mut stream) = AudioOutput::channel(2);
        out.try_reserve().unwrap().unwrap().send(vec![1.0]);
        out.try_reserve().unwrap().unwrap().send(vec![2.0]);
        assert!(out.try_reserve().unwrap().is_none());
        assert_eq!(out.available(), 0);

        assert_eq!(stream.recv().await, Some(vec![1.0]));
        out.reserve().await.unwrap().send(vec![3.0]);
        assert_eq!(stream.try_recv().unwrap(), vec![2.0]);
        assert_eq!(stream.try_recv().unwrap(), vec![3.0]);
    }

    #[tokio::test]
    async fn test_output_errors_once_device_is_gone() {
        let (out, stream) = AudioOutput::channel(1);
        drop(stream);
        assert!(out.is_closed());
        assert!(matches!(out.try_reserve(), Err(EngineError::Device(_))));
        assert!(out.reserve().await.is_err());
    }

    #[tokio::test]
    async fn test_channel_device_hands_out_streams() {
        let (device, mut streams) = ChannelDevice::new();
        let out = device.open(7, &AudioFormat::default(), 4).unwrap();
        let (id, mut stream) = streams.recv().await.unwrap();
        assert_eq!(id, 7);

        out.reserve().await.unwrap().send(vec![0.5; 4]);
        assert_eq!(stream.recv().await.unwrap().len(), 4);

        drop(streams);
        assert!(device.open(8, &AudioFormat::default(), 4).is_err());
    }

    #[test]
    fn test_null_device_drains() {
        let fmt = AudioFormat {
            sample_rate: 48_000,
            channels: 1,
            chunk_frames: 48,
        };
        let out = NullDevice.open(0, &fmt, 1).unwrap();
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            for i in 0..5 {
                out.reserve().await.unwrap().send(vec![i as f32; 48]);
            }
        });
    }
}
