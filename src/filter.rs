//! Filter pipeline: decides per message whether its media is downloaded,
//! only its metadata is exported, or it is skipped.
//!
//! Checks run in a fixed order (media presence, kind, format, date, count
//! cap) and the first rejection wins. Nothing here touches I/O; the running
//! count of accepted media items is supplied by the caller.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::source::Message;
use crate::types::MediaKind;

/// Allowed formats for one media kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatRule {
    Any,
    /// Lower-case format names.
    Only(BTreeSet<String>),
}

impl FormatRule {
    /// Build a rule from config values; `all` anywhere in the list is the
    /// wildcard.
    pub fn from_list<S: AsRef<str>>(formats: &[S]) -> Self {
        if formats
            .iter()
            .any(|f| f.as_ref().trim().eq_ignore_ascii_case("all"))
        {
            return FormatRule::Any;
        }
        FormatRule::Only(
            formats
                .iter()
                .map(|f| f.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|f| !f.is_empty())
                .collect(),
        )
    }

    fn allows(&self, format: Option<&str>) -> bool {
        match self {
            FormatRule::Any => true,
            FormatRule::Only(set) => format.is_some_and(|f| set.contains(&f.to_ascii_lowercase())),
        }
    }
}

/// Immutable per-run snapshot of what to archive.
#[derive(Debug, Clone, Default)]
pub struct FilterCriteria {
    pub media_types: BTreeSet<MediaKind>,
    /// Kinds missing from this map fall back to
    /// [`MediaKind::requires_format_selection`].
    pub file_formats: HashMap<MediaKind, FormatRule>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub max_messages: Option<usize>,
    pub export_messages: bool,
}

impl FilterCriteria {
    fn format_allowed(&self, kind: MediaKind, format: Option<&str>) -> bool {
        match self.file_formats.get(&kind) {
            Some(rule) => rule.allows(format),
            None => !kind.requires_format_selection(),
        }
    }

    fn in_date_range(&self, date: &DateTime<Utc>) -> bool {
        if self.start_date.is_some_and(|start| *date < start) {
            return false;
        }
        if self.end_date.is_some_and(|end| *date > end) {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoMedia,
    KindNotSelected,
    FormatNotAllowed,
    OutsideDateRange,
    CountCap,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoMedia => "no media",
            Self::KindNotSelected => "media type not selected",
            Self::FormatNotAllowed => "format not allowed",
            Self::OutsideDateRange => "outside date range",
            Self::CountCap => "max_messages reached",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Media passes every check and should be downloaded (and its metadata
    /// exported when export is on).
    Download,
    /// No media, but metadata export is on and the date range matches.
    ExportOnly,
    Skip(SkipReason),
}

/// Classify one message. `accepted_so_far` counts media items already
/// passed to the download orchestrator this run.
pub fn evaluate(message: &Message, criteria: &FilterCriteria, accepted_so_far: usize) -> Verdict {
    let Some(media) = &message.media else {
        if !criteria.export_messages {
            return Verdict::Skip(SkipReason::NoMedia);
        }
        if !criteria.in_date_range(&message.date) {
            return Verdict::Skip(SkipReason::OutsideDateRange);
        }
        return Verdict::ExportOnly;
    };

    if !criteria.media_types.contains(&media.kind) {
        return Verdict::Skip(SkipReason::KindNotSelected);
    }
    let format = media.effective_format();
    if !criteria.format_allowed(media.kind, format.as_deref()) {
        return Verdict::Skip(SkipReason::FormatNotAllowed);
    }
    if !criteria.in_date_range(&message.date) {
        return Verdict::Skip(SkipReason::OutsideDateRange);
    }
    if criteria
        .max_messages
        .is_some_and(|cap| accepted_so_far >= cap)
    {
        return Verdict::Skip(SkipReason::CountCap);
    }
    Verdict::Download
}

/// Boolean form of [`evaluate`]: true when the message's media should be
/// handed to the download orchestrator.
#[cfg(test)]
fn accepts(message: &Message, criteria: &FilterCriteria, accepted_so_far: usize) -> bool {
    evaluate(message, criteria, accepted_so_far) == Verdict::Download
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MediaDescriptor, Sender};
    use chrono::TimeZone;

    fn message(id: i64, media: Option<(MediaKind, Option<&str>)>) -> Message {
        Message {
            id,
            date: Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap(),
            sender: Sender::default(),
            text: String::new(),
            media: media.map(|(kind, format)| MediaDescriptor {
                kind,
                remote_reference: format!("ref-{id}"),
                file_name: None,
                mime_type: None,
                format: format.map(str::to_string),
                byte_size: 10,
            }),
            chat_id: None,
            views: None,
            forwards: None,
            reply_to_id: None,
        }
    }

    fn photos_only() -> FilterCriteria {
        FilterCriteria {
            media_types: [MediaKind::Photo].into_iter().collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_no_media_skipped_without_export() {
        let verdict = evaluate(&message(1, None), &photos_only(), 0);
        assert_eq!(verdict, Verdict::Skip(SkipReason::NoMedia));
    }

    #[test]
    fn test_no_media_exported_when_enabled() {
        let criteria = FilterCriteria {
            export_messages: true,
            ..photos_only()
        };
        assert_eq!(evaluate(&message(1, None), &criteria, 0), Verdict::ExportOnly);
        assert!(!accepts(&message(1, None), &criteria, 0));
    }

    #[test]
    fn test_no_media_export_respects_date_range() {
        let criteria = FilterCriteria {
            export_messages: true,
            start_date: Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()),
            ..photos_only()
        };
        assert_eq!(
            evaluate(&message(1, None), &criteria, 0),
            Verdict::Skip(SkipReason::OutsideDateRange)
        );
    }

    #[test]
    fn test_kind_not_selected() {
        let msg = message(1, Some((MediaKind::Voice, None)));
        assert_eq!(
            evaluate(&msg, &photos_only(), 0),
            Verdict::Skip(SkipReason::KindNotSelected)
        );
    }

    #[test]
    fn test_photo_without_format_entry_accepted() {
        let msg = message(1, Some((MediaKind::Photo, None)));
        assert!(accepts(&msg, &photos_only(), 0));
    }

    #[test]
    fn test_document_without_format_entry_rejected() {
        let criteria = FilterCriteria {
            media_types: [MediaKind::Document].into_iter().collect(),
            ..Default::default()
        };
        let msg = message(1, Some((MediaKind::Document, Some("pdf"))));
        assert_eq!(
            evaluate(&msg, &criteria, 0),
            Verdict::Skip(SkipReason::FormatNotAllowed)
        );
    }

    #[test]
    fn test_format_list_case_insensitive() {
        let mut criteria = FilterCriteria {
            media_types: [MediaKind::Document].into_iter().collect(),
            ..Default::default()
        };
        criteria
            .file_formats
            .insert(MediaKind::Document, FormatRule::from_list(&["PDF", ".epub"]));
        assert!(accepts(
            &message(1, Some((MediaKind::Document, Some("pdf")))),
            &criteria,
            0
        ));
        assert!(accepts(
            &message(2, Some((MediaKind::Document, Some("EPUB")))),
            &criteria,
            0
        ));
        assert!(!accepts(
            &message(3, Some((MediaKind::Document, Some("zip")))),
            &criteria,
            0
        ));
    }

    #[test]
    fn test_all_wildcard() {
        assert_eq!(FormatRule::from_list(&["mp4", "All"]), FormatRule::Any);
        let mut criteria = FilterCriteria {
            media_types: [MediaKind::Video].into_iter().collect(),
            ..Default::default()
        };
        criteria.file_formats.insert(MediaKind::Video, FormatRule::Any);
        assert!(accepts(&message(1, Some((MediaKind::Video, None))), &criteria, 0));
    }

    #[test]
    fn test_date_bounds_inclusive() {
        let at = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let criteria = FilterCriteria {
            start_date: Some(at),
            end_date: Some(at),
            ..photos_only()
        };
        assert!(accepts(&message(1, Some((MediaKind::Photo, None))), &criteria, 0));

        let criteria = FilterCriteria {
            end_date: Some(Utc.with_ymd_and_hms(2024, 6, 15, 11, 59, 59).unwrap()),
            ..photos_only()
        };
        assert_eq!(
            evaluate(&message(1, Some((MediaKind::Photo, None))), &criteria, 0),
            Verdict::Skip(SkipReason::OutsideDateRange)
        );
    }

    #[test]
    fn test_count_cap_applies_to_accepted_items() {
        let criteria = FilterCriteria {
            max_messages: Some(2),
            ..photos_only()
        };
        let msg = message(1, Some((MediaKind::Photo, None)));
        assert!(accepts(&msg, &criteria, 0));
        assert!(accepts(&msg, &criteria, 1));
        assert_eq!(
            evaluate(&msg, &criteria, 2),
            Verdict::Skip(SkipReason::CountCap)
        );
    }

    #[test]
    fn test_earlier_rejection_wins_over_cap() {
        let criteria = FilterCriteria {
            max_messages: Some(0),
            ..photos_only()
        };
        let msg = message(1, Some((MediaKind::Audio, Some("mp3"))));
        assert_eq!(
            evaluate(&msg, &criteria, 5),
            Verdict::Skip(SkipReason::KindNotSelected)
        );
    }

    #[test]
    fn test_cap_does_not_block_export_only() {
        let criteria = FilterCriteria {
            max_messages: Some(0),
            export_messages: true,
            ..photos_only()
        };
        assert_eq!(evaluate(&message(1, None), &criteria, 0), Verdict::ExportOnly);
    }
}
