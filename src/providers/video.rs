//! Video provider adapter, YouTube-shaped.
//!
//! `pollOne`: resolve channel → uploads playlist, list the most recent N
//! playlist items (1 unit), batch-fetch full details for those video IDs in
//! chunks of 50 (1 unit per chunk) for duration + description. Filters out
//! Shorts (duration ≤ 180s, unknown duration kept fail-safe) and anything at
//! or before the subscription's watermark.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::db::models::{CanonicalItem, Provider, RawItem, Subscription};
use crate::error::IngestError;
use crate::providers::{PollContext, PollOutcome, ProviderAdapter};

const PLAYLIST_ITEMS_MAX_RESULTS: u32 = 10;
const VIDEO_DETAILS_CHUNK: usize = 50;
/// Shorts filter threshold: duration must be `>` this, strictly.
const SHORTS_DURATION_THRESHOLD_SECS: i64 = 180;

pub struct VideoAdapter;

#[derive(Debug, Deserialize)]
struct PlaylistItemsResponse {
    #[serde(default)]
    items: Vec<PlaylistItemEntry>,
}

#[derive(Debug, Deserialize)]
struct PlaylistItemEntry {
    #[serde(rename = "contentDetails")]
    content_details: PlaylistItemContentDetails,
}

#[derive(Debug, Deserialize)]
struct PlaylistItemContentDetails {
    #[serde(rename = "videoId")]
    video_id: String,
}

#[derive(Debug, Deserialize)]
struct VideosResponse {
    #[serde(default)]
    items: Vec<VideoEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VideoEntry {
    id: String,
    snippet: VideoSnippet,
    #[serde(rename = "contentDetails")]
    content_details: VideoContentDetails,
}

#[derive(Debug, Deserialize, Clone)]
struct VideoSnippet {
    title: String,
    description: Option<String>,
    #[serde(rename = "publishedAt")]
    published_at: DateTime<Utc>,
    #[serde(rename = "channelId")]
    channel_id: String,
    #[serde(rename = "channelTitle")]
    channel_title: String,
    thumbnails: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Clone, Default)]
struct VideoContentDetails {
    duration: Option<String>,
}

#[async_trait]
impl ProviderAdapter for VideoAdapter {
    fn provider(&self) -> Provider {
        Provider::Video
    }

    async fn poll_one(&self, ctx: &PollContext, sub: &Subscription) -> Result<PollOutcome, IngestError> {
        let uploads_playlist_id = uploads_playlist_id_for_channel(&sub.provider_channel_id);
        let items_url = format!(
            "https://www.googleapis.com/youtube/v3/playlistItems?part=contentDetails&playlistId={uploads_playlist_id}&maxResults={PLAYLIST_ITEMS_MAX_RESULTS}"
        );

        let listing_json = fetch_tracked(ctx, 1, &items_url).await?;
        let listing: PlaylistItemsResponse = serde_json::from_value(listing_json)?;
        if listing.items.is_empty() {
            return Ok(PollOutcome { unchanged: true, ..Default::default() });
        }

        let video_ids: Vec<String> = listing.items.into_iter().map(|e| e.content_details.video_id).collect();
        let mut videos = Vec::new();
        for chunk in video_ids.chunks(VIDEO_DETAILS_CHUNK) {
            let ids_param = chunk.join(",");
            let details_url = format!(
                "https://www.googleapis.com/youtube/v3/videos?part=snippet,contentDetails&id={ids_param}"
            );
            let details_json = fetch_tracked(ctx, 1, &details_url).await?;
            let details: VideosResponse = serde_json::from_value(details_json)?;
            videos.extend(details.items);
        }

        let raw_items = filter_and_transform(videos, sub.last_published_at, sub.last_polled_at.is_none());
        Ok(PollOutcome::from_items(raw_items))
    }
}

async fn fetch_tracked(ctx: &PollContext, units: u32, url: &str) -> Result<serde_json::Value, IngestError> {
    ctx.quota
        .with_tracking(units, || async {
            ctx.rate_limiter
                .fetch(Provider::Video.as_str(), &ctx.user_id, || async { ctx.http.get_json(url, &ctx.access_token).await })
                .await
        })
        .await
}

/// A real uploads-playlist ID is `UC...` → `UU...`; YouTube's convention is
/// to swap the second character. If the channel ID doesn't look like a
/// standard `UC` channel ID, fall back to using it directly (some test
/// fixtures and legacy channel IDs won't match the pattern).
fn uploads_playlist_id_for_channel(channel_id: &str) -> String {
    if let Some(rest) = channel_id.strip_prefix("UC") {
        format!("UU{rest}")
    } else {
        channel_id.to_string()
    }
}

/// Shorts filter: exclude duration `<= 180s`.
/// Unknown duration is kept — fail-safe, losing content is worse than a
/// false keep.
fn passes_shorts_filter(duration_seconds: Option<i64>) -> bool {
    match duration_seconds {
        Some(d) => d > SHORTS_DURATION_THRESHOLD_SECS,
        None => true,
    }
}

/// Delta + first-poll trimming + Shorts filter + transform, as one pure
/// pipeline so it's testable without any network dependency.
fn filter_and_transform(videos: Vec<VideoEntry>, watermark: Option<DateTime<Utc>>, first_poll: bool) -> Vec<RawItem> {
    let mut candidates: Vec<RawItem> = videos
        .into_iter()
        .filter(|v| passes_shorts_filter(parse_iso8601_duration(v.content_details.duration.as_deref())))
        .filter(|v| watermark.map_or(true, |wm| v.snippet.published_at > wm))
        .map(transform)
        .collect();

    candidates.sort_by_key(|r| std::cmp::Reverse(r.canonical.published_at));

    if first_poll {
        // First-ever poll ingests at most the single most-recent item,
        // to prevent a flood of "historic" items.
        candidates.truncate(1);
    }

    candidates
}

fn transform(video: VideoEntry) -> RawItem {
    let duration_seconds = parse_iso8601_duration(video.content_details.duration.as_deref());
    let thumbnail_url = video
        .snippet
        .thumbnails
        .as_ref()
        .and_then(|t| t.get("high").or_else(|| t.get("default")))
        .and_then(|t| t.get("url"))
        .and_then(|u| u.as_str())
        .map(str::to_string);

    RawItem {
        provider_id: video.id.clone(),
        provider_creator_id: Some(video.snippet.channel_id.clone()),
        creator_display_name: Some(video.snippet.channel_title.clone()),
        canonical: CanonicalItem {
            content_type: "video".into(),
            canonical_url: format!("https://www.youtube.com/watch?v={}", video.id),
            title: video.snippet.title,
            summary: video.snippet.description,
            published_at: video.snippet.published_at,
            duration_seconds,
            thumbnail_url,
            raw_metadata: None,
        },
    }
}

/// Parses ISO-8601 durations (`PT#H#M#S`) to whole seconds. Returns `None`
/// for an absent or unparseable value (kept by the fail-safe Shorts filter).
fn parse_iso8601_duration(duration: Option<&str>) -> Option<i64> {
    let s = duration?;
    let s = s.strip_prefix('P')?;
    let (date_part, time_part) = match s.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (s, None),
    };
    if !date_part.is_empty() {
        // This provider only ever reports durations, never calendar spans;
        // a non-empty date component (weeks/days) means the string isn't a
        // video duration we understand.
        return None;
    }
    let time_part = time_part?;

    let mut total = 0i64;
    let mut number = String::new();
    for ch in time_part.chars() {
        if ch.is_ascii_digit() {
            number.push(ch);
            continue;
        }
        let value: i64 = number.parse().ok()?;
        number.clear();
        total += match ch {
            'H' => value * 3600,
            'M' => value * 60,
            'S' => value,
            _ => return None,
        };
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn video_fixture(id: &str, duration: Option<&str>, published_at: DateTime<Utc>) -> VideoEntry {
        VideoEntry {
            id: id.into(),
            snippet: VideoSnippet {
                title: format!("Video {id}"),
                description: Some("desc".into()),
                published_at,
                channel_id: "UCabc123".into(),
                channel_title: "Some Channel".into(),
                thumbnails: None,
            },
            content_details: VideoContentDetails { duration: duration.map(str::to_string) },
        }
    }

    #[test]
    fn parses_iso8601_durations() {
        assert_eq!(parse_iso8601_duration(Some("PT3M1S")), Some(181));
        assert_eq!(parse_iso8601_duration(Some("PT1H2M3S")), Some(3723));
        assert_eq!(parse_iso8601_duration(Some("PT3M")), Some(180));
        assert_eq!(parse_iso8601_duration(Some("PT0S")), Some(0));
        assert_eq!(parse_iso8601_duration(None), None);
        assert_eq!(parse_iso8601_duration(Some("garbage")), None);
    }

    /// Durations `60, 180, 181, 300, undefined` → keep `181, 300, undefined`
    /// (3 items); `180` is excluded (not `>` threshold).
    #[test]
    fn shorts_filter_boundary() {
        let now = Utc::now();
        let videos = vec![
            video_fixture("a", Some("PT1M"), now),
            video_fixture("b", Some("PT3M"), now),
            video_fixture("c", Some("PT3M1S"), now),
            video_fixture("d", Some("PT5M"), now),
            video_fixture("e", None, now),
        ];
        let kept = filter_and_transform(videos, None, false);
        let ids: Vec<_> = kept.iter().map(|r| r.provider_id.clone()).collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.contains(&"c".to_string()));
        assert!(ids.contains(&"d".to_string()));
        assert!(ids.contains(&"e".to_string()));
        assert!(!ids.contains(&"a".to_string()));
        assert!(!ids.contains(&"b".to_string()));
    }

    /// First poll (`lastPolledAt = NULL`) ingests at most the single
    /// most-recent item.
    #[test]
    fn first_poll_trims_to_one_most_recent() {
        let now = Utc::now();
        let videos = vec![
            video_fixture("old", Some("PT5M"), now - Duration::days(2)),
            video_fixture("new", Some("PT5M"), now - Duration::days(1)),
        ];
        let kept = filter_and_transform(videos, None, true);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].provider_id, "new");
    }

    #[test]
    fn delta_excludes_items_at_or_before_watermark() {
        let now = Utc::now();
        let watermark = now - Duration::days(1);
        let videos = vec![
            video_fixture("before", Some("PT5M"), watermark - Duration::hours(1)),
            video_fixture("at", Some("PT5M"), watermark),
            video_fixture("after", Some("PT5M"), watermark + Duration::hours(1)),
        ];
        let kept = filter_and_transform(videos, Some(watermark), false);
        let ids: Vec<_> = kept.iter().map(|r| r.provider_id.clone()).collect();
        assert_eq!(ids, vec!["after".to_string()]);
    }

    #[test]
    fn uploads_playlist_id_swaps_uc_prefix() {
        assert_eq!(uploads_playlist_id_for_channel("UCabc123"), "UUabc123");
        assert_eq!(uploads_playlist_id_for_channel("custom-id"), "custom-id");
    }

    #[test]
    fn transform_builds_canonical_url_and_keeps_channel_as_creator() {
        let video = video_fixture("yt-9", Some("PT5M"), Utc::now());
        let raw = transform(video);
        assert_eq!(raw.canonical.canonical_url, "https://www.youtube.com/watch?v=yt-9");
        assert_eq!(raw.provider_creator_id.as_deref(), Some("UCabc123"));
    }
}
