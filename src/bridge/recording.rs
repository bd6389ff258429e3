//! Frame recording extension
//!
//! While recording is on for a Session, every successful action is followed by
//! one best-effort capture call whose result is kept as a [`Frame`]. Stopping
//! returns a summary of what was captured and hands the frames' non-text
//! content back on the attachment side channel.

use crate::mcp::types::Content;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// One captured frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    pub captured_at: DateTime<Utc>,
    /// Raw name of the action that triggered the capture
    pub after_tool: String,
    pub text: String,
    #[serde(skip)]
    pub attachments: Vec<Content>,
}

/// Result of stopping a recording
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingSummary {
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
    pub captured: usize,
    pub dropped: usize,
    pub failed: usize,
    pub frames: Vec<Frame>,
}

impl RecordingSummary {
    /// Human-readable report returned to the calling agent
    pub fn describe(&self) -> String {
        let seconds = (self.stopped_at - self.started_at).num_milliseconds() as f64 / 1000.0;
        let mut text = format!(
            "Recording stopped after {:.1}s: {} frame(s) captured",
            seconds, self.captured
        );
        if self.dropped > 0 {
            text.push_str(&format!(", {} oldest dropped", self.dropped));
        }
        if self.failed > 0 {
            text.push_str(&format!(", {} capture(s) failed", self.failed));
        }
        text.push('.');
        for (index, frame) in self.frames.iter().enumerate() {
            text.push_str(&format!(
                "\n[{}] {} after {}",
                index + 1,
                frame.captured_at.format("%H:%M:%S%.3f"),
                frame.after_tool
            ));
            if !frame.text.is_empty() {
                text.push_str(": ");
                text.push_str(&frame.text);
            }
        }
        text
    }

    /// Non-text content of every kept frame, in capture order
    pub fn attachments(&self) -> Vec<Content> {
        self.frames
            .iter()
            .flat_map(|f| f.attachments.iter().cloned())
            .collect()
    }
}

/// Per-Session recording state
#[derive(Debug)]
pub struct RecordingState {
    max_frames: usize,
    started_at: Option<DateTime<Utc>>,
    frames: VecDeque<Frame>,
    captured: usize,
    failed: usize,
}

impl RecordingState {
    pub fn new(max_frames: usize) -> Self {
        Self {
            max_frames: max_frames.max(1),
            started_at: None,
            frames: VecDeque::new(),
            captured: 0,
            failed: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.started_at.is_some()
    }

    /// Begin recording; returns false if it was already on
    pub fn start(&mut self) -> bool {
        if self.is_active() {
            return false;
        }
        self.started_at = Some(Utc::now());
        self.frames.clear();
        self.captured = 0;
        self.failed = 0;
        true
    }

    /// Keep a frame, evicting the oldest past the cap
    pub fn push(&mut self, frame: Frame) {
        if !self.is_active() {
            return;
        }
        self.captured += 1;
        self.frames.push_back(frame);
        while self.frames.len() > self.max_frames {
            self.frames.pop_front();
        }
    }

    pub fn record_failure(&mut self) {
        if self.is_active() {
            self.failed += 1;
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// End recording and hand back everything kept
    pub fn stop(&mut self) -> Option<RecordingSummary> {
        let started_at = self.started_at.take()?;
        let frames: Vec<Frame> = self.frames.drain(..).collect();
        Some(RecordingSummary {
            started_at,
            stopped_at: Utc::now(),
            captured: self.captured,
            dropped: self.captured - frames.len(),
            failed: self.failed,
            frames,
        })
    }
}
