//! Voice activity detection
//!
//! Frames are classified by RMS energy against two thresholds. Speech starts
//! after a run of frames at or above the positive threshold and ends after
//! a run of redemption frames below the negative threshold. Frames between
//! the two thresholds neither confirm nor end speech.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::capture::{AudioInput, FRAME_SIZE, MicTap};
use crate::Result;
use crate::audio::rms;
use crate::config::VadConfig;

/// Event emitted by the detector
#[derive(Debug, Clone, PartialEq)]
pub enum VadEvent {
    /// Sustained speech crossed the positive threshold
    SpeechStarted,
    /// Speech ended; carries the buffered utterance when buffering is on
    SpeechEnded(Option<Vec<f32>>),
    /// The microphone stream closed while the detector was active
    StreamEnded,
}

/// State of the speech detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    /// Waiting for speech
    Silent,
    /// Voiced frames seen, not yet enough to confirm speech
    Pending,
    /// Speech confirmed, accumulating the utterance
    Speaking,
}

/// Frame-by-frame speech detector
pub struct SpeechDetector {
    config: VadConfig,
    state: DetectorState,
    preroll: VecDeque<Vec<f32>>,
    pending: Vec<Vec<f32>>,
    speech: Vec<f32>,
    redemption: usize,
    since_voiced: usize,
}

impl SpeechDetector {
    /// Create a detector
    #[must_use]
    pub fn new(config: VadConfig) -> Self {
        tracing::debug!(
            positive = config.positive_threshold,
            negative = config.negative_threshold,
            min_speech_frames = config.min_speech_frames,
            redemption_frames = config.redemption_frames,
            "speech detector initialized"
        );

        Self {
            config,
            state: DetectorState::Silent,
            preroll: VecDeque::new(),
            pending: Vec::new(),
            speech: Vec::new(),
            redemption: 0,
            since_voiced: 0,
        }
    }

    /// Classify one frame; returns an event on a speech boundary
    pub fn process_frame(&mut self, frame: &[f32]) -> Option<VadEvent> {
        let energy = rms(frame);
        let voiced = energy >= self.config.positive_threshold;

        match self.state {
            DetectorState::Silent => {
                if voiced {
                    self.pending.push(frame.to_vec());
                    self.state = DetectorState::Pending;
                    tracing::trace!(energy, "voiced frame, pending");
                    return self.confirm_if_sustained();
                }
                self.push_preroll(frame);
                None
            }
            DetectorState::Pending => {
                if voiced {
                    self.pending.push(frame.to_vec());
                    return self.confirm_if_sustained();
                }
                // Run broken before it was sustained: the frames become pre-roll
                for f in std::mem::take(&mut self.pending) {
                    self.push_preroll(&f);
                }
                self.push_preroll(frame);
                self.state = DetectorState::Silent;
                tracing::trace!(energy, "voiced run too short");
                None
            }
            DetectorState::Speaking => {
                if self.config.buffer_speech {
                    self.speech.extend_from_slice(frame);
                }

                if voiced {
                    self.redemption = 0;
                    self.since_voiced = 0;
                } else {
                    self.since_voiced += 1;
                    if energy < self.config.negative_threshold {
                        self.redemption += 1;
                    }
                }

                tracing::trace!(
                    energy,
                    redemption = self.redemption,
                    since_voiced = self.since_voiced,
                    "speaking"
                );

                if self.redemption >= self.config.redemption_frames {
                    return Some(self.end_speech());
                }
                if self.since_voiced >= self.config.silence_capture_frames() {
                    tracing::debug!("no end of speech within silence capture window");
                    return Some(self.end_speech());
                }
                None
            }
        }
    }

    fn push_preroll(&mut self, frame: &[f32]) {
        if self.config.pre_speech_pad_frames == 0 {
            return;
        }
        if self.preroll.len() == self.config.pre_speech_pad_frames {
            self.preroll.pop_front();
        }
        self.preroll.push_back(frame.to_vec());
    }

    fn confirm_if_sustained(&mut self) -> Option<VadEvent> {
        if self.pending.len() < self.config.min_speech_frames.max(1) {
            return None;
        }

        self.speech.clear();
        if self.config.buffer_speech {
            for frame in self.preroll.drain(..).chain(self.pending.drain(..)) {
                self.speech.extend_from_slice(&frame);
            }
        } else {
            self.preroll.clear();
            self.pending.clear();
        }

        self.state = DetectorState::Speaking;
        self.redemption = 0;
        self.since_voiced = 0;
        tracing::debug!("speech started");
        Some(VadEvent::SpeechStarted)
    }

    fn end_speech(&mut self) -> VadEvent {
        self.state = DetectorState::Silent;
        self.redemption = 0;
        self.since_voiced = 0;

        let samples = std::mem::take(&mut self.speech);
        tracing::debug!(samples = samples.len(), "speech ended");
        VadEvent::SpeechEnded(self.config.buffer_speech.then_some(samples))
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> DetectorState {
        self.state
    }

    /// Buffered utterance so far
    #[must_use]
    pub fn speech_buffer(&self) -> &[f32] {
        &self.speech
    }

}

/// Runs the speech detector over the live microphone stream
pub struct VoiceActivityDetector {
    input: Arc<dyn AudioInput>,
    config: VadConfig,
    tap: MicTap,
    events: mpsc::UnboundedSender<VadEvent>,
    task: Option<JoinHandle<()>>,
}

impl VoiceActivityDetector {
    /// Create an inactive detector that reports on `events`
    #[must_use]
    pub fn new(
        input: Arc<dyn AudioInput>,
        config: VadConfig,
        events: mpsc::UnboundedSender<VadEvent>,
    ) -> Self {
        Self {
            input,
            config,
            tap: MicTap::new(),
            events,
            task: None,
        }
    }

    /// Tap the recorder attaches to
    #[must_use]
    pub fn tap(&self) -> MicTap {
        self.tap.clone()
    }

    /// Whether analysis is running
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Start analysing the microphone; no-op when already active
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if the microphone cannot be opened
    pub fn activate(&mut self) -> Result<()> {
        if self.is_active() {
            return Ok(());
        }

        let mut stream = self.input.open()?;
        let tap = self.tap.clone();
        let events = self.events.clone();
        let mut detector = SpeechDetector::new(self.config.clone());

        tap.set_live(true);
        self.task = Some(tokio::spawn(async move {
            let mut pending: Vec<f32> = Vec::with_capacity(FRAME_SIZE * 2);

            while let Some(block) = stream.next_block().await {
                pending.extend_from_slice(&block);

                while pending.len() >= FRAME_SIZE {
                    let frame: Vec<f32> = pending.drain(..FRAME_SIZE).collect();
                    tap.feed(&frame);
                    if let Some(event) = detector.process_frame(&frame)
                        && events.send(event).is_err()
                    {
                        tracing::debug!("vad event receiver dropped");
                        tap.set_live(false);
                        return;
                    }
                }
            }

            tracing::warn!("microphone stream ended");
            tap.set_live(false);
            let _ = events.send(VadEvent::StreamEnded);
        }));

        tracing::info!("voice activity detection active");
        Ok(())
    }

    /// Pause analysis, stopping any recording that reads from the tap first
    pub fn deactivate(&mut self) {
        self.tap.set_live(false);
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::info!("voice activity detection paused");
        }
    }
}

impl Drop for VoiceActivityDetector {
    fn drop(&mut self) {
        self.deactivate();
    }
}
