use std::{cmp::Ordering, collections::HashSet, fmt};

use serde::{Deserialize, Serialize};

/// One rendition as reported by the resolver, before any filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFormat {
    pub quality_label: Option<String>,
    pub container: String,
    pub audio_bitrate: Option<u32>,
    pub has_audio: bool,
    pub has_video: bool,
    pub height: Option<u32>,
    pub bitrate: Option<u64>,
    pub url: String,
}

/// A downloadable rendition as shown to (and sent back by) the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatDescriptor {
    pub quality: String,
    pub container: String,
    #[serde(default)]
    pub audio_bitrate: Option<u32>,
    #[serde(default)]
    pub has_audio: bool,
    #[serde(rename = "url")]
    pub source_url: String,
}

impl FormatDescriptor {
    fn key(&self) -> (&str, &str, bool) {
        (&self.quality, &self.container, self.has_audio)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFilter {
    AudioAndVideo,
    VideoOnly,
}

impl StreamFilter {
    pub fn for_descriptor(descriptor: &FormatDescriptor) -> Self {
        if descriptor.has_audio {
            Self::AudioAndVideo
        } else {
            Self::VideoOnly
        }
    }

    pub fn matches(self, has_audio: bool, has_video: bool) -> bool {
        match self {
            Self::AudioAndVideo => has_audio && has_video,
            Self::VideoOnly => has_video,
        }
    }
}

impl fmt::Display for StreamFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AudioAndVideo => f.write_str("audioandvideo"),
            Self::VideoOnly => f.write_str("video"),
        }
    }
}

/// Deduplicates raw formats by `(quality, container, has_audio)`.
///
/// Entries without a quality label are dropped first. A listed format has
/// audio only when it reports an audio bitrate. The first entry seen for a
/// key wins, whatever its bitrate, and output order follows input order.
pub fn build_catalog(raw_formats: &[RawFormat]) -> Vec<FormatDescriptor> {
    let mut seen = HashSet::new();
    let mut catalog = Vec::new();

    for raw in raw_formats {
        let Some(quality) = raw.quality_label.as_deref().filter(|q| !q.is_empty()) else {
            continue;
        };

        let descriptor = FormatDescriptor {
            quality: quality.to_string(),
            container: raw.container.clone(),
            audio_bitrate: raw.audio_bitrate,
            has_audio: raw.audio_bitrate.is_some(),
            source_url: raw.url.clone(),
        };

        let (quality, container, has_audio) = descriptor.key();
        if seen.insert((quality.to_string(), container.to_string(), has_audio)) {
            catalog.push(descriptor);
        }
    }

    catalog
}

/// Picks the highest quality format that satisfies `filter`.
///
/// Ranked by height, then overall bitrate; ties keep the earliest entry.
pub fn choose_best(raw_formats: &[RawFormat], filter: StreamFilter) -> Option<FormatDescriptor> {
    raw_formats
        .iter()
        .filter(|raw| filter.matches(raw.has_audio, raw.has_video))
        .fold(None::<&RawFormat>, |best, candidate| match best {
            Some(current) if rank(candidate, current) != Ordering::Greater => Some(current),
            _ => Some(candidate),
        })
        .map(|raw| FormatDescriptor {
            quality: raw
                .quality_label
                .clone()
                .or_else(|| raw.height.map(|height| format!("{height}p")))
                .unwrap_or_else(|| "unknown".to_string()),
            container: raw.container.clone(),
            audio_bitrate: raw.audio_bitrate,
            has_audio: raw.has_audio,
            source_url: raw.url.clone(),
        })
}

fn rank(a: &RawFormat, b: &RawFormat) -> Ordering {
    a.height
        .unwrap_or_default()
        .cmp(&b.height.unwrap_or_default())
        .then_with(|| a.bitrate.unwrap_or_default().cmp(&b.bitrate.unwrap_or_default()))
}
