//! Admin / repair operations. Both dry-run-capable, exposed as plain
//! library functions here and as `repair` subcommands of the service binary.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::db::models::Provider;
use crate::db::repos::{creators, items, subscriptions};
use crate::db::DbPool;
use crate::error::IngestError;
use crate::providers::{normalize_name, synthesize_creator_id};

/// Subscriptions where `lastPublishedAt > newestItemAt + 1 day`, or where
/// `lastPublishedAt` is set and no items exist.
const WATERMARK_DRIFT_TOLERANCE: Duration = Duration::days(1);

#[derive(Debug, Clone, Serialize)]
pub struct WatermarkRepairCandidate {
    pub subscription_id: String,
    pub current_watermark: Option<DateTime<Utc>>,
    pub newest_item_at: Option<DateTime<Utc>>,
    pub item_count: i64,
    /// What the watermark would be (or was) reset to. `None` means a full
    /// backfill is triggered on the next poll.
    pub proposed_watermark: Option<DateTime<Utc>>,
}

/// Scan every subscription for a corrupted watermark and, unless `dry_run`,
/// reset it via `subscriptions::repair_watermark` (the sole sanctioned
/// watermark-monotonicity violation). Returns every candidate found either
/// way, so dry-run and apply-mode share one code path and one report shape.
pub fn repair_watermarks(pool: &DbPool, dry_run: bool) -> Result<Vec<WatermarkRepairCandidate>, IngestError> {
    let mut candidates = Vec::new();

    for sub in subscriptions::get_all(pool)? {
        let Some(current_watermark) = sub.last_published_at else { continue };
        let newest_item_at = subscriptions::newest_item_at(pool, &sub.id)?;
        let item_count = subscriptions::item_count(pool, &sub.id)?;

        let drifted = match newest_item_at {
            Some(newest) => current_watermark > newest + WATERMARK_DRIFT_TOLERANCE,
            None => item_count == 0,
        };
        if !drifted {
            continue;
        }

        let proposed_watermark = newest_item_at;
        if !dry_run {
            subscriptions::repair_watermark(pool, &sub.id, proposed_watermark)?;
        }

        candidates.push(WatermarkRepairCandidate {
            subscription_id: sub.id,
            current_watermark: Some(current_watermark),
            newest_item_at,
            item_count,
            proposed_watermark,
        });
    }

    Ok(candidates)
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatorBackfillCandidate {
    pub item_id: String,
    pub provider: String,
    pub creator_id: String,
    pub display_name: String,
}

const BACKFILL_PROVIDERS: [Provider; 4] = [Provider::Video, Provider::Podcast, Provider::Newsletter, Provider::WebFeed];

/// Creator backfill: items left with `creator_id = NULL` (a state the live
/// ingestion pipeline no longer produces, but legacy rows or direct imports
/// can). For each, recover a display name from `rawMetadata` if the provider
/// left one there, falling back to the same synthesize-from-provider-id
/// scheme `ingestion::resolve_creator` uses as its own last resort. Two
/// orphaned items that normalize to the same name for the same provider
/// converge on one `Creator` row — `get_by_normalized_name` first, so a
/// prior backfill run (or ordinary ingestion) that already created that
/// creator is reused rather than duplicated.
pub fn backfill_creators(pool: &DbPool, dry_run: bool) -> Result<Vec<CreatorBackfillCandidate>, IngestError> {
    let mut candidates = Vec::new();

    for provider in BACKFILL_PROVIDERS {
        let provider_str = provider.as_str();
        for item in items::get_missing_creator(pool, provider_str)? {
            let display_name = display_name_from_raw_metadata(item.raw_metadata.as_deref())
                .unwrap_or_else(|| item.provider_id.clone());
            let normalized_name = normalize_name(&display_name);

            let creator = match creators::get_by_normalized_name(pool, provider_str, &normalized_name)? {
                Some(existing) => existing,
                None => {
                    let provider_creator_id = synthesize_creator_id(provider_str, &normalized_name);
                    creators::find_or_create(pool, provider_str, &provider_creator_id, &display_name, &normalized_name, None, None, None)?
                }
            };

            if !dry_run {
                items::set_creator(pool, &item.id, &creator.id)?;
            }

            candidates.push(CreatorBackfillCandidate {
                item_id: item.id,
                provider: provider_str.to_string(),
                creator_id: creator.id,
                display_name,
            });
        }
    }

    Ok(candidates)
}

/// Best-effort extraction of a creator display name from an item's stored
/// `rawMetadata` JSON blob. No provider in this crate currently populates
/// `raw_metadata` on ingestion (see providers::*::transform), so this is the
/// hook for whatever provider-specific path map a future adapter change adds
/// rather than a live code path today.
fn display_name_from_raw_metadata(raw_metadata: Option<&str>) -> Option<String> {
    let raw_metadata = raw_metadata?;
    let value: serde_json::Value = serde_json::from_str(raw_metadata).ok()?;
    for key in ["creatorName", "channelTitle", "author", "ownerName"] {
        if let Some(name) = value.get(key).and_then(|v| v.as_str()) {
            if !name.trim().is_empty() {
                return Some(name.trim().to_string());
            }
        }
    }
    None
}
