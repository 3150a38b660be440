//! Email-newsletter provider adapter, Gmail-shaped.
//!
//! Unlike the other adapters, a newsletter "subscription" isn't a fixed
//! channel — it's a mailbox sync job. Candidate feeds are discovered message
//! by message and persisted through `db::repos::newsletter_feeds` before
//! ingestion can happen, since a feed's `status` (explicit opt-in model)
//! gates whether its messages are surfaced at all. The opaque Gmail
//! `historyId` cursor is carried on the `Mailbox` row (`history_cursor`),
//! not on the `Subscription` — a mailbox sync spans every newsletter feed
//! for a user, so the cursor belongs to the mailbox, not to any one
//! subscription row.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::db::models::{CanonicalItem, Provider, RawItem, Subscription};
use crate::db::repos::{mailboxes, newsletter_feeds};
use crate::error::IngestError;
use crate::providers::{normalize_name, synthesize_creator_id, PollContext, PollOutcome, ProviderAdapter};

const NEWSLETTER_SCORE_THRESHOLD: f64 = 0.78;
const INITIAL_QUERY_WINDOW_DAYS: i64 = 30;
const HEADER_NAMES: &str = "From,Subject,Date,List-Id,List-Unsubscribe,List-Unsubscribe-Post";

pub struct NewsletterAdapter;

#[derive(Debug, Clone, Default)]
pub struct MessageHeaders {
    pub from: String,
    pub subject: String,
    pub date: Option<String>,
    pub list_id: Option<String>,
    pub list_unsubscribe: Option<String>,
    pub list_unsubscribe_post: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    history: Vec<HistoryEntry>,
    #[serde(rename = "historyId")]
    history_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    #[serde(rename = "messagesAdded", default)]
    messages_added: Vec<MessageAddedEntry>,
}

#[derive(Debug, Deserialize)]
struct MessageAddedEntry {
    message: MessageRef,
}

#[derive(Debug, Deserialize)]
struct MessageMetadataResponse {
    #[serde(default)]
    payload: Option<MessagePayload>,
}

#[derive(Debug, Deserialize)]
struct MessagePayload {
    #[serde(default)]
    headers: Vec<MessageHeaderEntry>,
}

#[derive(Debug, Deserialize)]
struct MessageHeaderEntry {
    name: String,
    value: String,
}

impl MessagePayload {
    fn into_headers(self) -> MessageHeaders {
        let mut map: HashMap<String, String> = HashMap::new();
        for h in self.headers {
            map.insert(h.name.to_lowercase(), h.value);
        }
        MessageHeaders {
            from: map.remove("from").unwrap_or_default(),
            subject: map.remove("subject").unwrap_or_default(),
            date: map.remove("date"),
            list_id: map.remove("list-id"),
            list_unsubscribe: map.remove("list-unsubscribe"),
            list_unsubscribe_post: map.remove("list-unsubscribe-post"),
        }
    }
}

#[async_trait]
impl ProviderAdapter for NewsletterAdapter {
    fn provider(&self) -> Provider {
        Provider::Newsletter
    }

    async fn poll_one(&self, ctx: &PollContext, _sub: &Subscription) -> Result<PollOutcome, IngestError> {
        let mailbox = mailboxes::get_or_create(&ctx.pool, &ctx.user_id, Provider::Newsletter.as_str())?;
        let cursor = mailbox.history_cursor.clone();

        let (message_ids, next_cursor) = match cursor {
            Some(history_id) => match list_message_ids_since(ctx, &history_id).await {
                Ok(result) => result,
                Err(e) if is_history_expired(&e) => {
                    // Gmail's history window expired (404): the cursor is
                    // stale, fall back to the initial 30-day query.
                    mailboxes::clear_cursor(&ctx.pool, &mailbox.id)?;
                    list_message_ids_initial(ctx).await?
                }
                Err(e) => return Err(e),
            },
            None => list_message_ids_initial(ctx).await?,
        };

        if let Some(ref next) = next_cursor {
            mailboxes::advance_cursor(&ctx.pool, &mailbox.id, next)?;
        }

        let mut raw_items = Vec::new();
        for message_id in message_ids {
            let headers = fetch_headers(ctx, &message_id).await?;
            let score = score_newsletter(&headers);
            if !accepts_as_newsletter(score, &headers) {
                continue;
            }

            let canonical_key = derive_canonical_key(&headers);
            let feed = newsletter_feeds::upsert_observation(&ctx.pool, &ctx.user_id, &canonical_key, score)?;
            if feed.status != "ACTIVE" {
                // Explicit opt-in model: a freshly-discovered or
                // user-hidden feed doesn't surface items until the user
                // subscribes to it.
                continue;
            }

            let body_html = fetch_body_html(ctx, &message_id).await?;
            let candidates = extract_candidates(&body_html);
            let sender_domain = domain_of_email(&headers.from);
            let list_id_domain = headers.list_id.as_deref().map(domain_of_list_id);
            let best_url = pick_best_issue_url(&candidates, sender_domain.as_deref(), list_id_domain.as_deref())
                .map(|c| unwrap_redirect(&c.href))
                .unwrap_or_else(|| format!("https://mail.google.com/mail/u/0/#inbox/{message_id}"));

            let provider_creator_id = synthesize_creator_id(Provider::Newsletter.as_str(), &normalize_name(&canonical_key));
            raw_items.push(RawItem {
                provider_id: message_id.clone(),
                provider_creator_id: Some(provider_creator_id),
                creator_display_name: Some(display_name_of(&headers.from)),
                canonical: CanonicalItem {
                    content_type: "newsletter_issue".into(),
                    canonical_url: best_url,
                    title: headers.subject.clone(),
                    summary: None,
                    published_at: parse_message_date(headers.date.as_deref()).unwrap_or_else(Utc::now),
                    duration_seconds: None,
                    thumbnail_url: None,
                    raw_metadata: None,
                },
            });
        }

        Ok(PollOutcome::from_items(raw_items))
    }
}

/// Upgrade rule: a message observed before its body could be fetched (or
/// whose body carried no recoverable issue link) is ingested under the Gmail
/// deep-link fallback. `ingestion::ingest_item` checks this on every
/// re-observation of an already-ingested newsletter item so a later poll that
/// does resolve a real issue link can upgrade the stored canonical URL.
pub fn is_fallback_url(url: &str) -> bool {
    url.contains("mail.google.com/mail/u/0/#inbox/")
}

fn is_history_expired(err: &IngestError) -> bool {
    matches!(err, IngestError::Provider(msg) if msg.contains("404"))
}

async fn list_message_ids_initial(ctx: &PollContext) -> Result<(Vec<String>, Option<String>), IngestError> {
    let url = format!(
        "https://gmail.googleapis.com/gmail/v1/users/me/messages?q=newer_than:{INITIAL_QUERY_WINDOW_DAYS}d"
    );
    let json = fetch_tracked(ctx, 5, &url).await?;
    let listing: MessageListResponse = serde_json::from_value(json)?;
    Ok((listing.messages.into_iter().map(|m| m.id).collect(), None))
}

async fn list_message_ids_since(ctx: &PollContext, start_history_id: &str) -> Result<(Vec<String>, Option<String>), IngestError> {
    let url = format!("https://gmail.googleapis.com/gmail/v1/users/me/history?startHistoryId={start_history_id}&historyTypes=messageAdded");
    let json = fetch_tracked(ctx, 2, &url).await?;
    let history: HistoryResponse = serde_json::from_value(json)?;
    let ids = history
        .history
        .into_iter()
        .flat_map(|h| h.messages_added.into_iter().map(|m| m.message.id))
        .collect();
    Ok((ids, history.history_id))
}

async fn fetch_headers(ctx: &PollContext, message_id: &str) -> Result<MessageHeaders, IngestError> {
    let url = format!(
        "https://gmail.googleapis.com/gmail/v1/users/me/messages/{message_id}?format=metadata&metadataHeaders={HEADER_NAMES}"
    );
    let json = fetch_tracked(ctx, 1, &url).await?;
    let msg: MessageMetadataResponse = serde_json::from_value(json)?;
    Ok(msg.payload.map(MessagePayload::into_headers).unwrap_or_default())
}

async fn fetch_body_html(ctx: &PollContext, message_id: &str) -> Result<String, IngestError> {
    let url = format!("https://gmail.googleapis.com/gmail/v1/users/me/messages/{message_id}?format=full");
    let json = fetch_tracked(ctx, 5, &url).await?;
    let payload = json.get("payload");
    Ok(payload.and_then(find_html_part).unwrap_or_default())
}

/// Gmail's message resource nests MIME parts recursively; depth-first find
/// the first `text/html` part and decode its base64url body.
fn find_html_part(payload: &serde_json::Value) -> Option<String> {
    let mime_type = payload.get("mimeType").and_then(|v| v.as_str()).unwrap_or_default();
    if mime_type == "text/html" {
        if let Some(data) = payload.get("body").and_then(|b| b.get("data")).and_then(|d| d.as_str()) {
            return decode_base64url(data);
        }
    }
    if let Some(parts) = payload.get("parts").and_then(|p| p.as_array()) {
        for part in parts {
            if let Some(html) = find_html_part(part) {
                return Some(html);
            }
        }
    }
    None
}

fn decode_base64url(data: &str) -> Option<String> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(data).ok()?;
    String::from_utf8(bytes).ok()
}

async fn fetch_tracked(ctx: &PollContext, units: u32, url: &str) -> Result<serde_json::Value, IngestError> {
    ctx.quota
        .with_tracking(units, || async {
            ctx.rate_limiter
                .fetch(Provider::Newsletter.as_str(), &ctx.user_id, || async { ctx.http.get_json(url, &ctx.access_token).await })
                .await
        })
        .await
}

fn display_name_of(from_header: &str) -> String {
    if let Some(idx) = from_header.find('<') {
        from_header[..idx].trim().trim_matches('"').to_string()
    } else {
        from_header.trim().to_string()
    }
}

fn email_of(from_header: &str) -> String {
    if let (Some(start), Some(end)) = (from_header.find('<'), from_header.find('>')) {
        from_header[start + 1..end].trim().to_string()
    } else {
        from_header.trim().to_string()
    }
}

fn domain_of_email(from_header: &str) -> Option<String> {
    let email = email_of(from_header);
    email.split('@').nth(1).map(|d| d.to_lowercase())
}

fn domain_of_list_id(list_id: &str) -> String {
    list_id.trim_matches(|c| c == '<' || c == '>').to_lowercase()
}

/// Email `Date` headers are RFC 2822; fall back to the observation time if
/// absent or malformed rather than reaching for a permissive date parser.
fn parse_message_date(date_header: Option<&str>) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(date_header?).ok().map(|d| d.with_timezone(&Utc))
}

/// Additive/subtractive weighted score over headers. Clamped to `[0,1]`.
fn score_newsletter(headers: &MessageHeaders) -> f64 {
    let subject_lower = headers.subject.to_lowercase();
    let from_lower = headers.from.to_lowercase();
    let list_id_lower = headers.list_id.as_deref().unwrap_or_default().to_lowercase();
    let combined = format!("{subject_lower} {from_lower} {list_id_lower}");

    let mut score = 0.0;
    let has_list_id = headers.list_id.is_some();
    let has_unsubscribe = headers.list_unsubscribe.is_some();

    if has_list_id {
        score += 0.33;
    }
    if has_unsubscribe {
        score += 0.22;
    }
    if headers.list_unsubscribe_post.as_deref().map(|v| v.eq_ignore_ascii_case("One-Click")).unwrap_or(false) {
        score += 0.10;
    }
    if contains_any(&combined, &["newsletter", "digest", "briefing", "roundup", "weekly", "daily", "issue", "dispatch", "substack"]) {
        score += 0.24;
    }
    if contains_any(&combined, &["substack", "beehiiv", "convertkit", "mailchimp", "ghost"]) {
        score += 0.20;
    }
    if has_list_id && has_unsubscribe {
        score += 0.12;
    }

    if contains_any(&from_lower, &["no-reply", "noreply", "notification", "notifications", "billing", "support", "security", "alert", "alerts", "account", "accounts"]) {
        score -= 0.45;
    }
    if contains_any(&subject_lower, &["receipt", "invoice", "verification", "password", "order", "shipping", "login", "pull request", "mentioned"]) {
        score -= 0.65;
    }
    if contains_any(&subject_lower, &["% off", "sale", "discount", "deal", "limited time", "promo"]) {
        score -= 0.20;
    }

    score.clamp(0.0, 1.0)
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Accept iff score clears the threshold AND isn't a transactional sender
/// with no compensating newsletter signal (GitHub PR notifications, for
/// instance, carry List-Id/List-Unsubscribe but are transactional).
fn accepts_as_newsletter(score: f64, headers: &MessageHeaders) -> bool {
    if score < NEWSLETTER_SCORE_THRESHOLD {
        return false;
    }
    let subject_lower = headers.subject.to_lowercase();
    let from_lower = headers.from.to_lowercase();
    let transactional_sender = contains_any(&from_lower, &["no-reply", "noreply", "notification", "notifications"]);
    let newsletter_signal = contains_any(&subject_lower, &["newsletter", "digest", "briefing", "roundup", "weekly", "daily", "issue", "dispatch"]);
    !(transactional_sender && !newsletter_signal && contains_any(&subject_lower, &["pull request", "mentioned", "issue opened", "commented"]))
}

/// Feed identity priority order: List-Id → unsubscribe URL → unsubscribe
/// mailto → sender.
fn derive_canonical_key(headers: &MessageHeaders) -> String {
    if let Some(list_id) = &headers.list_id {
        return format!("list-id:{}", domain_of_list_id(list_id));
    }
    if let Some(unsub) = &headers.list_unsubscribe {
        if let Some(url) = extract_unsubscribe_url(unsub) {
            return format!("unsub-url:{}", url.to_lowercase());
        }
        if let Some(mailto) = extract_unsubscribe_mailto(unsub) {
            return format!("unsub-mailto:{}", mailto.to_lowercase());
        }
    }
    format!("sender:{}", email_of(&headers.from).to_lowercase())
}

fn extract_unsubscribe_url(header: &str) -> Option<String> {
    header.split(',').map(str::trim).find_map(|part| {
        let inner = part.trim_matches(|c| c == '<' || c == '>');
        inner.starts_with("http").then(|| inner.to_string())
    })
}

fn extract_unsubscribe_mailto(header: &str) -> Option<String> {
    header.split(',').map(str::trim).find_map(|part| {
        let inner = part.trim_matches(|c| c == '<' || c == '>');
        inner.strip_prefix("mailto:").map(|s| s.to_string())
    })
}

#[derive(Debug, Clone, PartialEq)]
enum CandidateSource {
    HtmlAnchor,
    Text,
    Snippet,
}

#[derive(Debug, Clone)]
struct UrlCandidate {
    href: String,
    anchor_text: String,
    source: CandidateSource,
    index: usize,
}

/// Extremely small HTML anchor scraper: good enough to find `<a href=...>`
/// tags in a newsletter body without pulling in a full HTML parser the rest
/// of this crate has no other use for.
fn extract_candidates(html: &str) -> Vec<UrlCandidate> {
    let mut candidates = Vec::new();
    let mut index = 0;
    let mut rest = html;
    while let Some(tag_start) = rest.find("<a ") {
        rest = &rest[tag_start..];
        let Some(tag_end_pos) = rest.find('>') else {
            // Unclosed "<a " with no ">" anywhere after it; skip past the
            // literal match and keep scanning rather than giving up on the
            // whole document.
            rest = &rest[3..];
            continue;
        };
        // Bound the href search to this tag's own span so a later anchor's
        // href= can never leak into a href-less anchor's candidate.
        let tag = &rest[..tag_end_pos];
        let after_tag = &rest[tag_end_pos + 1..];
        let close_pos = after_tag.find("</a>").unwrap_or(0);
        let anchor_text = after_tag[..close_pos].trim().to_string();
        rest = &after_tag[close_pos.min(after_tag.len())..];

        let href = tag.find("href=").and_then(|href_pos| {
            let after_href = &tag[href_pos + 5..];
            let quote_char = after_href.chars().next().filter(|c| *c == '"' || *c == '\'')?;
            let body = &after_href[1..];
            let end_quote = body.find(quote_char)?;
            Some(body[..end_quote].to_string())
        });

        let Some(href) = href else {
            // No (parseable) href on this anchor — skip just this one.
            continue;
        };

        candidates.push(UrlCandidate { href, anchor_text, source: CandidateSource::HtmlAnchor, index });
        index += 1;
    }
    candidates
}

const NON_CONTENT_ANCHOR: &[&str] = &["unsubscribe", "manage", "preferences", "privacy", "terms", "view in browser"];
const CONTENT_HINT_PATH: &[&str] = &["/p/", "/post", "/posts/", "/article", "/blog", "/stories", "/issues", "/watch"];

fn score_candidate(candidate: &UrlCandidate, sender_domain: Option<&str>, list_id_domain: Option<&str>) -> f64 {
    let mut score = match candidate.source {
        CandidateSource::HtmlAnchor => 1.3,
        CandidateSource::Text => 1.0,
        CandidateSource::Snippet => 0.7,
    };

    let anchor_lower = candidate.anchor_text.to_lowercase();
    let href_lower = candidate.href.to_lowercase();

    if contains_any(&anchor_lower, NON_CONTENT_ANCHOR) {
        score -= 1.1;
    }
    if candidate.anchor_text.len() > 8 {
        score += 0.35;
    }
    if contains_any(&href_lower, CONTENT_HINT_PATH) {
        score += 1.35;
    }
    if href_lower.contains(".substack.com") {
        score += 0.75;
        if href_lower.contains("/p/") {
            score += 1.1;
        }
    }
    if let Some(domain) = sender_domain {
        if href_lower.contains(domain) {
            score += 0.50;
        }
    }
    if let Some(domain) = list_id_domain {
        if href_lower.contains(domain) {
            score += 0.35;
        }
    }
    score - 0.015 * candidate.index as f64
}

fn pick_best_issue_url<'a>(candidates: &'a [UrlCandidate], sender_domain: Option<&str>, list_id_domain: Option<&str>) -> Option<&'a UrlCandidate> {
    candidates
        .iter()
        .map(|c| (c, score_candidate(c, sender_domain, list_id_domain)))
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(c, _)| c)
}

/// Unwraps known redirect shapes: Google's `/url?q=`, Substack's
/// `/redirect/`, and `open.substack.com/pub/X/p/Y` canonicalization.
fn unwrap_redirect(url: &str) -> String {
    if let Some(idx) = url.find("/url?q=") {
        let after = &url[idx + "/url?q=".len()..];
        let value = after.split('&').next().unwrap_or(after);
        if let Ok(decoded) = urlencoding_decode(value) {
            return decoded;
        }
    }
    if let Some(idx) = url.find("/redirect/") {
        let after = &url[idx + "/redirect/".len()..];
        let value = after.split(['?', '&']).next().unwrap_or(after);
        if let Ok(decoded) = urlencoding_decode(value) {
            return decoded;
        }
    }
    if let Some(idx) = url.find("open.substack.com/pub/") {
        let after = &url[idx + "open.substack.com/pub/".len()..];
        let mut parts = after.splitn(3, '/');
        if let (Some(publication), Some(_p_marker), Some(slug)) = (parts.next(), parts.next(), parts.next()) {
            let slug = slug.split(['?', '#']).next().unwrap_or(slug);
            return format!("https://{publication}.substack.com/p/{slug}");
        }
    }
    url.to_string()
}

/// Percent-decoding sufficient for the redirect-unwrap cases above; avoids
/// pulling a full URL-encoding crate in for one call site.
fn urlencoding_decode(s: &str) -> Result<String, std::string::FromUtf8Error> {
    let mut bytes = Vec::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '%' {
            let hi = chars.next();
            let lo = chars.next();
            if let (Some(hi), Some(lo)) = (hi, lo) {
                if let Ok(byte) = u8::from_str_radix(&format!("{hi}{lo}"), 16) {
                    bytes.push(byte);
                    continue;
                }
            }
            bytes.push(b'%');
        } else {
            bytes.extend(c.to_string().as_bytes());
        }
    }
    String::from_utf8(bytes)
}
