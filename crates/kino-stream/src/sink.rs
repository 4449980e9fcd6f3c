//! Media sink seam

use crate::{
    types::{SinkSample, TrackType},
    Error, Result,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Receives injected fragments
#[async_trait]
pub trait MediaSink: Send + Sync {
    /// Hand a sample to the renderer; may apply backpressure
    async fn push(&self, sample: SinkSample) -> Result<()>;

    /// No more samples will be pushed for `track`
    async fn end_of_stream(&self, _track: TrackType) {}

    /// Current rendering position of `track`, if the sink reports one
    fn playback_position(&self, _track: TrackType) -> Option<f64> {
        None
    }
}

/// Item delivered by [`ChannelSink`]
#[derive(Debug, Clone)]
pub enum SinkEvent {
    Sample(SinkSample),
    EndOfStream(TrackType),
}

/// Sink forwarding samples over a bounded channel
pub struct ChannelSink {
    tx: mpsc::Sender<SinkEvent>,
    positions: Mutex<HashMap<TrackType, f64>>,
}

impl ChannelSink {
    /// Create the sink and the receiving end
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SinkEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                positions: Mutex::new(HashMap::new()),
            },
            rx,
        )
    }

    /// Report the renderer position used for buffer health sampling
    pub fn set_playback_position(&self, track: TrackType, position: f64) {
        if let Ok(mut positions) = self.positions.lock() {
            positions.insert(track, position);
        }
    }
}

#[async_trait]
impl MediaSink for ChannelSink {
    async fn push(&self, sample: SinkSample) -> Result<()> {
        self.tx
            .send(SinkEvent::Sample(sample))
            .await
            .map_err(|_| Error::Sink("sink receiver dropped".into()))
    }

    async fn end_of_stream(&self, track: TrackType) {
        let _ = self.tx.send(SinkEvent::EndOfStream(track)).await;
    }

    fn playback_position(&self, track: TrackType) -> Option<f64> {
        self.positions.lock().ok()?.get(&track).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MediaType;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_channel_sink_delivery() {
        let (sink, mut rx) = ChannelSink::new(4);
        sink.push(SinkSample {
            track: TrackType::Audio,
            media_type: MediaType::Audio,
            payload: Bytes::from_static(b"aac"),
            pts: 2.0,
            dts: 2.0,
            duration: 2.0,
            is_init: false,
            is_discontinuity: false,
        })
        .await
        .unwrap();
        sink.end_of_stream(TrackType::Audio).await;

        match rx.recv().await {
            Some(SinkEvent::Sample(sample)) => assert_eq!(sample.pts, 2.0),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(rx.recv().await, Some(SinkEvent::EndOfStream(TrackType::Audio))));

        assert_eq!(sink.playback_position(TrackType::Audio), None);
        sink.set_playback_position(TrackType::Audio, 1.5);
        assert_eq!(sink.playback_position(TrackType::Audio), Some(1.5));

        drop(rx);
        let closed = sink
            .push(SinkSample {
                track: TrackType::Audio,
                media_type: MediaType::Audio,
                payload: Bytes::new(),
                pts: 4.0,
                dts: 4.0,
                duration: 2.0,
                is_init: false,
                is_discontinuity: false,
            })
            .await;
        assert!(matches!(closed, Err(Error::Sink(_))));
    }
}
