//! GOP cache for late joiners
//!
//! A subscriber that attaches mid-stream needs, in order:
//! 1. the metadata
//! 2. the sequence headers (video decoder config, AudioSpecificConfig)
//! 3. the most recent keyframe and everything published since
//!
//! so its decoder can start immediately instead of waiting for the next
//! keyframe.

use std::collections::VecDeque;

use super::packet::{MediaPacket, PacketKind};

/// Default cap on buffered GOP bytes (4 MiB)
pub const DEFAULT_MAX_GOP_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug)]
pub struct GopCache {
    enabled: bool,
    max_bytes: usize,
    current_bytes: usize,
    metadata: Option<MediaPacket>,
    video_header: Option<MediaPacket>,
    audio_header: Option<MediaPacket>,
    /// Packets since the last keyframe; empty until a keyframe arrives
    frames: VecDeque<MediaPacket>,
}

impl GopCache {
    pub fn new() -> Self {
        Self::with_max_bytes(DEFAULT_MAX_GOP_BYTES)
    }

    pub fn with_max_bytes(max_bytes: usize) -> Self {
        Self {
            enabled: true,
            max_bytes,
            current_bytes: 0,
            metadata: None,
            video_header: None,
            audio_header: None,
            frames: VecDeque::new(),
        }
    }

    /// Keep only metadata and headers, never frames
    pub fn headers_only(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Record a packet
    ///
    /// Headers and metadata replace their cached copy. A keyframe starts a
    /// new GOP; other packets are appended only once a GOP has started. A GOP
    /// outgrowing `max_bytes` is dropped whole, since a GOP without its
    /// keyframe is useless to a decoder.
    pub fn push(&mut self, packet: &MediaPacket) {
        match packet.kind {
            PacketKind::Metadata => {
                self.metadata = Some(packet.clone());
                return;
            }
            PacketKind::Video if packet.header => {
                self.video_header = Some(packet.clone());
                return;
            }
            PacketKind::Audio if packet.header => {
                self.audio_header = Some(packet.clone());
                return;
            }
            _ => {}
        }

        if !self.enabled {
            return;
        }

        if packet.is_video() && packet.keyframe {
            self.clear_frames();
        } else if self.frames.is_empty() {
            return;
        }

        if self.current_bytes + packet.size() > self.max_bytes {
            tracing::debug!(
                bytes = self.current_bytes,
                limit = self.max_bytes,
                "GOP exceeds cache limit, dropping until next keyframe"
            );
            self.clear_frames();
            return;
        }

        self.current_bytes += packet.size();
        self.frames.push_back(packet.clone());
    }

    pub fn clear_frames(&mut self) {
        self.frames.clear();
        self.current_bytes = 0;
    }

    /// Forget everything (publisher left)
    pub fn clear(&mut self) {
        self.clear_frames();
        self.metadata = None;
        self.video_header = None;
        self.audio_header = None;
    }

    /// Metadata, video header, audio header, then the GOP in arrival order
    pub fn catchup(&self) -> Vec<MediaPacket> {
        let mut out = Vec::with_capacity(self.frames.len() + 3);
        out.extend(self.metadata.iter().cloned());
        out.extend(self.video_header.iter().cloned());
        out.extend(self.audio_header.iter().cloned());
        out.extend(self.frames.iter().cloned());
        out
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn size(&self) -> usize {
        self.current_bytes
    }

    pub fn has_keyframe(&self) -> bool {
        !self.frames.is_empty()
    }

    /// Span of the cached GOP in milliseconds
    pub fn duration(&self) -> Option<u32> {
        let first = self.frames.front()?.timestamp;
        let last = self.frames.back()?.timestamp;
        Some(last.wrapping_sub(first))
    }
}

impl Default for GopCache {
    fn default() -> Self {
        Self::new()
    }
}
