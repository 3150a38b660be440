//! Podcast provider adapter, Spotify-shaped.
//!
//! `pollBatch` is the main quota optimization this provider exists to prove
//! out: "get multiple shows" once per 50 subscriptions, compare the
//! provider-reported `totalEpisodes` against the stored count, and only
//! fetch episodes for shows whose total increased. Show metadata is cached
//! for 6h in the side KV to avoid re-reading unchanged shows.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::{CanonicalItem, Provider, RawItem, Subscription};
use crate::error::IngestError;
use crate::providers::{PollContext, PollOutcome, ProviderAdapter};

const SHOWS_BATCH_SIZE: usize = 50;
const SHOW_CACHE_TTL: chrono::Duration = chrono::Duration::hours(6);

pub struct PodcastAdapter;

#[derive(Debug, Deserialize)]
struct ShowsResponse {
    shows: Vec<ShowEntry>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct ShowEntry {
    id: String,
    name: String,
    publisher: Option<String>,
    #[serde(rename = "total_episodes")]
    total_episodes: i64,
}

#[derive(Debug, Deserialize)]
struct EpisodesResponse {
    items: Vec<EpisodeEntry>,
}

#[derive(Debug, Deserialize, Clone)]
struct EpisodeEntry {
    id: String,
    name: String,
    description: Option<String>,
    #[serde(rename = "release_date")]
    release_date: String,
    #[serde(rename = "duration_ms")]
    duration_ms: Option<i64>,
    images: Option<Vec<SpotifyImage>>,
    external_urls: Option<ExternalUrls>,
}

#[derive(Debug, Deserialize, Clone)]
struct SpotifyImage {
    url: String,
}

#[derive(Debug, Deserialize, Clone)]
struct ExternalUrls {
    spotify: Option<String>,
}

#[async_trait]
impl ProviderAdapter for PodcastAdapter {
    fn provider(&self) -> Provider {
        Provider::Podcast
    }

    fn supports_batch(&self) -> bool {
        true
    }

    async fn poll_one(&self, ctx: &PollContext, sub: &Subscription) -> Result<PollOutcome, IngestError> {
        let results = self.poll_batch(ctx, std::slice::from_ref(sub)).await?;
        results
            .into_iter()
            .next()
            .map(|(_, outcome)| outcome)
            .unwrap_or_else(|| Ok(PollOutcome { unchanged: true, ..Default::default() }))
    }

    async fn poll_batch(
        &self,
        ctx: &PollContext,
        subs: &[Subscription],
    ) -> Result<Vec<(String, Result<PollOutcome, IngestError>)>, IngestError> {
        let mut outcomes = Vec::new();

        for chunk in subs.chunks(SHOWS_BATCH_SIZE) {
            let mut shows_by_id: std::collections::HashMap<String, ShowEntry> = std::collections::HashMap::new();
            let mut uncached_ids = Vec::new();
            for sub in chunk {
                match cached_show(ctx, &sub.provider_channel_id) {
                    Some(show) => {
                        shows_by_id.insert(show.id.clone(), show);
                    }
                    None => uncached_ids.push(sub.provider_channel_id.as_str()),
                }
            }

            if !uncached_ids.is_empty() {
                let shows_url = format!("https://api.spotify.com/v1/shows?ids={}", uncached_ids.join(","));
                let shows_json = fetch_tracked(ctx, 1, &shows_url).await;
                match shows_json {
                    Ok(value) => match serde_json::from_value::<ShowsResponse>(value) {
                        Ok(shows) => {
                            for show in shows.shows {
                                cache_show(ctx, &show);
                                shows_by_id.insert(show.id.clone(), show);
                            }
                        }
                        Err(_) => {
                            for sub in chunk {
                                if !shows_by_id.contains_key(&sub.provider_channel_id) {
                                    outcomes.push((sub.id.clone(), Err(IngestError::Provider("malformed shows response".into()))));
                                }
                            }
                            continue;
                        }
                    },
                    Err(e) => {
                        for sub in chunk {
                            if !shows_by_id.contains_key(&sub.provider_channel_id) {
                                outcomes.push((sub.id.clone(), Err(clone_err(&e))));
                            }
                        }
                        continue;
                    }
                }
            }

            for sub in chunk {
                let show = shows_by_id.get(&sub.provider_channel_id);
                let Some(show) = show else {
                    outcomes.push((sub.id.clone(), Ok(PollOutcome { unchanged: true, ..Default::default() })));
                    continue;
                };

                // Unchanged total: skip the episode call entirely.
                if Some(show.total_episodes) == sub.total_items {
                    outcomes.push((
                        sub.id.clone(),
                        Ok(PollOutcome { unchanged: true, total_items: Some(show.total_episodes), ..Default::default() }),
                    ));
                    continue;
                }

                // Total changed: invalidate the cached show metadata so the
                // next cycle re-fetches it rather than trusting a stale count.
                let _ = ctx.cache.delete(&show_cache_key(&show.id));

                let episodes_url = format!("https://api.spotify.com/v1/shows/{}/episodes?limit=20", show.id);
                let episodes_result = fetch_tracked(ctx, 1, &episodes_url).await;
                match episodes_result {
                    Ok(value) => {
                        let episodes: EpisodesResponse = match serde_json::from_value(value) {
                            Ok(e) => e,
                            Err(e) => {
                                outcomes.push((sub.id.clone(), Err(IngestError::Serde(e))));
                                continue;
                            }
                        };
                        let raw_items =
                            filter_and_transform(episodes.items, show, sub.last_published_at, sub.last_polled_at.is_none());
                        let mut outcome = PollOutcome::from_items(raw_items);
                        outcome.total_items = Some(show.total_episodes);
                        outcomes.push((sub.id.clone(), Ok(outcome)));
                    }
                    Err(e) => outcomes.push((sub.id.clone(), Err(e))),
                }
            }
        }

        Ok(outcomes)
    }
}

fn clone_err(e: &IngestError) -> IngestError {
    IngestError::Provider(e.to_string())
}

fn show_cache_key(provider_channel_id: &str) -> String {
    format!("podcast:show:{provider_channel_id}")
}

/// Read-through 6h show-metadata cache: avoids re-fetching shows whose
/// metadata hasn't changed since the last cycle.
fn cached_show(ctx: &PollContext, provider_channel_id: &str) -> Option<ShowEntry> {
    let raw = ctx.cache.get(&show_cache_key(provider_channel_id)).ok().flatten()?;
    serde_json::from_str(&raw).ok()
}

fn cache_show(ctx: &PollContext, show: &ShowEntry) {
    if let Ok(raw) = serde_json::to_string(show) {
        let expires_at = chrono::Utc::now() + SHOW_CACHE_TTL;
        let _ = ctx.cache.set(&show_cache_key(&show.id), &raw, expires_at);
    }
}

async fn fetch_tracked(ctx: &PollContext, units: u32, url: &str) -> Result<serde_json::Value, IngestError> {
    ctx.quota
        .with_tracking(units, || async {
            ctx.rate_limiter
                .fetch(Provider::Podcast.as_str(), &ctx.user_id, || async { ctx.http.get_json(url, &ctx.access_token).await })
                .await
        })
        .await
}

fn filter_and_transform(episodes: Vec<EpisodeEntry>, show: &ShowEntry, watermark: Option<DateTime<Utc>>, first_poll: bool) -> Vec<RawItem> {
    let mut candidates: Vec<RawItem> = episodes
        .into_iter()
        .filter_map(|e| transform(e, show))
        .filter(|r| watermark.map_or(true, |wm| r.canonical.published_at > wm))
        .collect();

    candidates.sort_by_key(|r| std::cmp::Reverse(r.canonical.published_at));
    if first_poll {
        candidates.truncate(1);
    }
    candidates
}

fn transform(episode: EpisodeEntry, show: &ShowEntry) -> Option<RawItem> {
    let published_at = parse_release_date(&episode.release_date)?;
    let canonical_url = episode
        .external_urls
        .as_ref()
        .and_then(|u| u.spotify.clone())
        .unwrap_or_else(|| format!("https://open.spotify.com/episode/{}", episode.id));
    let thumbnail_url = episode.images.as_ref().and_then(|imgs| imgs.first()).map(|i| i.url.clone());

    Some(RawItem {
        provider_id: episode.id,
        provider_creator_id: Some(show.id.clone()),
        creator_display_name: Some(show.publisher.clone().unwrap_or_else(|| show.name.clone())),
        canonical: CanonicalItem {
            content_type: "podcast_episode".into(),
            canonical_url,
            title: episode.name,
            summary: episode.description,
            published_at,
            duration_seconds: episode.duration_ms.map(|ms| ms / 1000),
            thumbnail_url,
            raw_metadata: None,
        },
    })
}

/// Spotify's `release_date` may be `YYYY`, `YYYY-MM`, or `YYYY-MM-DD`;
/// normalize all three to UTC midnight with explicit parsing rather than
/// a permissive date parser.
fn parse_release_date(raw: &str) -> Option<DateTime<Utc>> {
    let parts: Vec<&str> = raw.split('-').collect();
    let (year, month, day) = match parts.as_slice() {
        [y] => (y.parse().ok()?, 1, 1),
        [y, m] => (y.parse().ok()?, m.parse().ok()?, 1),
        [y, m, d] => (y.parse().ok()?, m.parse().ok()?, d.parse().ok()?),
        _ => return None,
    };
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn show_fixture(total_episodes: i64) -> ShowEntry {
        ShowEntry { id: "show-1".into(), name: "Some Show".into(), publisher: Some("Some Publisher".into()), total_episodes }
    }

    fn episode_fixture(id: &str, release_date: &str) -> EpisodeEntry {
        EpisodeEntry {
            id: id.into(),
            name: format!("Episode {id}"),
            description: Some("desc".into()),
            release_date: release_date.into(),
            duration_ms: Some(1_800_000),
            images: None,
            external_urls: None,
        }
    }

    #[test]
    fn parses_full_date() {
        let d = parse_release_date("2023-12-19").unwrap();
        assert_eq!(d.format("%Y-%m-%d").to_string(), "2023-12-19");
        assert_eq!(d.format("%H:%M:%S").to_string(), "00:00:00");
    }

    #[test]
    fn parses_year_month() {
        let d = parse_release_date("2023-05").unwrap();
        assert_eq!(d.format("%Y-%m-%d").to_string(), "2023-05-01");
    }

    #[test]
    fn parses_year_only() {
        let d = parse_release_date("2023").unwrap();
        assert_eq!(d.format("%Y-%m-%d").to_string(), "2023-01-01");
    }

    #[test]
    fn rejects_garbage_dates() {
        assert!(parse_release_date("not-a-date").is_none());
        assert!(parse_release_date("2023-13-40").is_none());
    }

    #[test]
    fn transform_falls_back_to_open_spotify_url() {
        let show = show_fixture(10);
        let ep = episode_fixture("ep-1", "2023-01-01");
        let raw = transform(ep, &show).unwrap();
        assert_eq!(raw.canonical.canonical_url, "https://open.spotify.com/episode/ep-1");
        assert_eq!(raw.canonical.duration_seconds, Some(1800));
    }

    #[test]
    fn first_poll_trims_to_most_recent_episode() {
        let show = show_fixture(3);
        let episodes = vec![
            episode_fixture("old", "2023-01-01"),
            episode_fixture("new", "2023-06-01"),
        ];
        let kept = filter_and_transform(episodes, &show, None, true);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].provider_id, "new");
    }

    #[test]
    fn watermark_excludes_older_episodes() {
        let show = show_fixture(3);
        let watermark = parse_release_date("2023-03-01").unwrap();
        let episodes = vec![
            episode_fixture("before", "2023-01-01"),
            episode_fixture("after", "2023-06-01"),
        ];
        let kept = filter_and_transform(episodes, &show, Some(watermark), false);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].provider_id, "after");
    }
}
