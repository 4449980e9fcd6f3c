//! Shared fixtures for the pipeline integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use kino_stream::{
    config::{InitialProfile, PipelineConfig},
    drm::{DecryptError, Decryptor},
    net::{DownloadError, Downloaded, Downloader},
    sink::{ChannelSink, SinkEvent},
    types::{FragmentDescriptor, Profile, SinkSample},
    EventRecord, PipelineEvent, ProfileSet, TrackType,
};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use url::Url;

pub const TARGET_DURATION: f64 = 2.0;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Configuration with short waits and a monitor that stays quiet for the
/// length of a test
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.buffer.wait_timeout_ms = 20;
    config.fetch.refresh_wait_ms = 50;
    config.health.initial_delay_ms = 60_000;
    config.sync.wait_interval_ms = 10;
    config.sync.discontinuity_timeout_ms = 200;
    config
}

pub fn highest_first(mut config: PipelineConfig) -> PipelineConfig {
    config.abr.initial_profile = InitialProfile::Highest;
    config
}

pub fn create_test_profiles() -> ProfileSet {
    ProfileSet::new(vec![
        Profile::new("360p", 800_000).with_resolution(640, 360),
        Profile::new("720p", 2_800_000).with_resolution(1280, 720),
        Profile::new("1080p", 5_000_000).with_resolution(1920, 1080),
    ])
}

pub fn create_test_segments(track: TrackType, count: u64) -> Vec<FragmentDescriptor> {
    (0..count)
        .map(|n| {
            let uri = Url::parse(&format!("https://cdn.example.com/{}/seg{}.m4s", track, n)).unwrap();
            FragmentDescriptor::media(n, uri, n as f64 * TARGET_DURATION, TARGET_DURATION)
        })
        .collect()
}

/// Mark the fragment at `sequence` as the first after a timeline break
pub fn with_discontinuity_at(segments: Vec<FragmentDescriptor>, sequence: u64) -> Vec<FragmentDescriptor> {
    segments
        .into_iter()
        .map(|s| if s.sequence == sequence { s.with_discontinuity() } else { s })
        .collect()
}

pub fn init_segment(track: TrackType) -> FragmentDescriptor {
    let uri = Url::parse(&format!("https://cdn.example.com/{}/init.mp4", track)).unwrap();
    FragmentDescriptor::init(INIT_SEQUENCE, uri, 0.0)
}

/// Sequence number the init fixture is served under
pub const INIT_SEQUENCE: u64 = 999;

pub fn encrypted(segments: Vec<FragmentDescriptor>) -> Vec<FragmentDescriptor> {
    segments
        .into_iter()
        .map(|mut s| {
            s.encrypted = true;
            s
        })
        .collect()
}

/// Downloader answering from a script of failures keyed by sequence and profile
#[derive(Default)]
pub struct ScriptedDownloader {
    failures: Mutex<HashMap<(u64, Option<usize>), DownloadError>>,
    fail_all: Mutex<Option<DownloadError>>,
    requests: Mutex<Vec<(u64, usize)>>,
    delay: Duration,
}

impl ScriptedDownloader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Fail `sequence` at `profile` only
    pub fn fail_at(&self, sequence: u64, profile: usize, error: DownloadError) {
        self.failures.lock().unwrap().insert((sequence, Some(profile)), error);
    }

    /// Fail `sequence` at every profile
    pub fn fail_always(&self, sequence: u64, error: DownloadError) {
        self.failures.lock().unwrap().insert((sequence, None), error);
    }

    pub fn fail_everything(&self, error: DownloadError) {
        *self.fail_all.lock().unwrap() = Some(error);
    }

    /// (sequence, profile) of every request in order
    pub fn requests(&self) -> Vec<(u64, usize)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Downloader for ScriptedDownloader {
    async fn fetch(&self, descriptor: &FragmentDescriptor) -> Result<Downloaded, DownloadError> {
        let key = (descriptor.sequence, descriptor.profile_index);
        self.requests.lock().unwrap().push(key);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Some(err) = self.fail_all.lock().unwrap().clone() {
            return Err(err);
        }
        let failures = self.failures.lock().unwrap();
        if let Some(err) = failures
            .get(&(key.0, Some(key.1)))
            .or_else(|| failures.get(&(key.0, None)))
        {
            return Err(err.clone());
        }

        Ok(Downloaded {
            bytes: Bytes::from(format!("{}:{}", descriptor.uri, descriptor.profile_index)),
            http_status: 200,
            download_time: Duration::from_millis(1),
        })
    }
}

/// Decryptor whose license never arrives
pub struct StalledLicense;

#[async_trait]
impl Decryptor for StalledLicense {
    async fn decrypt(&self, _payload: Bytes, _descriptor: &FragmentDescriptor) -> Result<Bytes, DecryptError> {
        Err(DecryptError::KeyAcquisitionTimeout)
    }
}

/// Decryptor that rejects every fragment
pub struct BrokenCipher;

#[async_trait]
impl Decryptor for BrokenCipher {
    async fn decrypt(&self, _payload: Bytes, descriptor: &FragmentDescriptor) -> Result<Bytes, DecryptError> {
        Err(DecryptError::Failure(format!("bad key for fragment {}", descriptor.sequence)))
    }
}

/// Collect sink output until every track in `tracks` reached end of stream
pub async fn drain_until_end(
    rx: &mut mpsc::Receiver<SinkEvent>,
    tracks: &[TrackType],
    timeout: Duration,
) -> anyhow::Result<Vec<SinkEvent>> {
    let mut events = Vec::new();
    let mut remaining: Vec<TrackType> = tracks.to_vec();
    tokio::time::timeout(timeout, async {
        while !remaining.is_empty() {
            match rx.recv().await {
                Some(event) => {
                    if let SinkEvent::EndOfStream(track) = &event {
                        remaining.retain(|t| t != track);
                    }
                    events.push(event);
                }
                None => break,
            }
        }
    })
    .await?;
    Ok(events)
}

/// Media sample positions delivered for `track`
pub fn positions(events: &[SinkEvent], track: TrackType) -> Vec<f64> {
    events
        .iter()
        .filter_map(|e| match e {
            SinkEvent::Sample(s) if s.track == track && !s.is_init => Some(s.pts),
            _ => None,
        })
        .collect()
}

/// Next sample matching `pred`; everything else is discarded
pub async fn next_sample<F>(
    rx: &mut mpsc::Receiver<SinkEvent>,
    timeout: Duration,
    mut pred: F,
) -> anyhow::Result<SinkSample>
where
    F: FnMut(&SinkSample) -> bool,
{
    let sample = tokio::time::timeout(timeout, async {
        while let Some(event) = rx.recv().await {
            if let SinkEvent::Sample(sample) = event {
                if pred(&sample) {
                    return Ok(sample);
                }
            }
        }
        Err(anyhow::anyhow!("sink closed"))
    })
    .await??;
    Ok(sample)
}

/// Sequence number of the fragment a scripted download produced
pub fn sample_sequence(sample: &SinkSample) -> Option<u64> {
    let text = std::str::from_utf8(&sample.payload).ok()?;
    let start = text.find("/seg")? + 4;
    let end = start + text[start..].find(".m4s")?;
    text[start..end].parse().ok()
}

/// Wait for the first event matching `pred`
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<EventRecord>,
    timeout: Duration,
    mut pred: F,
) -> anyhow::Result<PipelineEvent>
where
    F: FnMut(&PipelineEvent) -> bool,
{
    let event = tokio::time::timeout(timeout, async {
        loop {
            match rx.recv().await {
                Ok(record) if pred(&record.event) => return Ok(record.event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(err) => return Err(anyhow::anyhow!("event bus closed: {}", err)),
            }
        }
    })
    .await??;
    Ok(event)
}

/// Events received so far without waiting
pub fn pending_events(rx: &mut broadcast::Receiver<EventRecord>) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(record) => events.push(record.event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

pub fn channel_sink() -> (std::sync::Arc<ChannelSink>, mpsc::Receiver<SinkEvent>) {
    channel_sink_with(64)
}

/// Sink whose channel holds `capacity` events, so delivery paces the pipeline
pub fn channel_sink_with(capacity: usize) -> (std::sync::Arc<ChannelSink>, mpsc::Receiver<SinkEvent>) {
    let (sink, rx) = ChannelSink::new(capacity);
    (std::sync::Arc::new(sink), rx)
}
