use std::fmt;

use serde::{Deserialize, Serialize};

/// Monotonically increasing message identifier within one chat.
pub type MessageId = i64;

/// Closed set of media kinds a chat message can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Document,
    Photo,
    Video,
    VideoNote,
    Voice,
}

impl MediaKind {
    pub const ALL: [MediaKind; 6] = [
        MediaKind::Audio,
        MediaKind::Document,
        MediaKind::Photo,
        MediaKind::Video,
        MediaKind::VideoNote,
        MediaKind::Voice,
    ];

    /// Name used in config files, the export file and as the per-kind
    /// download sub-directory.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Document => "document",
            Self::Photo => "photo",
            Self::Video => "video",
            Self::VideoNote => "video_note",
            Self::Voice => "voice",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "audio" => Some(Self::Audio),
            "document" => Some(Self::Document),
            "photo" => Some(Self::Photo),
            "video" => Some(Self::Video),
            "video_note" => Some(Self::VideoNote),
            "voice" => Some(Self::Voice),
            _ => None,
        }
    }

    /// Whether the operator picks formats for this kind. Photos, voice
    /// messages and round videos have a single container in practice, so a
    /// missing `file_formats` entry accepts them; the rest must be listed.
    pub fn requires_format_selection(&self) -> bool {
        matches!(self, Self::Audio | Self::Document | Self::Video)
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_kind_round_trip() {
        for kind in MediaKind::ALL {
            assert_eq!(MediaKind::from_str(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_media_kind_from_invalid() {
        assert_eq!(MediaKind::from_str("sticker"), None);
        assert_eq!(MediaKind::from_str("Photo"), None);
    }

    #[test]
    fn test_media_kind_serde_names() {
        let json = serde_json::to_string(&MediaKind::VideoNote).unwrap();
        assert_eq!(json, "\"video_note\"");
        let kind: MediaKind = serde_json::from_str("\"voice\"").unwrap();
        assert_eq!(kind, MediaKind::Voice);
    }

    #[test]
    fn test_format_selection_kinds() {
        assert!(MediaKind::Audio.requires_format_selection());
        assert!(MediaKind::Document.requires_format_selection());
        assert!(MediaKind::Video.requires_format_selection());
        assert!(!MediaKind::Photo.requires_format_selection());
        assert!(!MediaKind::Voice.requires_format_selection());
        assert!(!MediaKind::VideoNote.requires_format_selection());
    }
}
