//! Scrape provider backed by Apify actors.
//!
//! Each requested category group runs as one actor run: a timeline run for
//! posts and replies, then one run per social-graph category. A run is
//! started with a charge ceiling, polled for status and dataset size until
//! it ends, and its dataset is downloaded afterwards.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::*;

use super::budget::Usd;
use super::provider::{ProviderUpdate, RunOutcome, ScrapeOutput, ScrapeParams, ScrapeProvider};
use crate::snapshot::{self, Follow, MediaRef, Post, Profile, ReplyRef};
use crate::ScrapeCategory;

const APIFY_API_URL: &str = "https://api.apify.com/v2";

/// Actor ids for each kind of run.
#[derive(Debug, Clone)]
pub struct ApifyActors {
    pub timeline: String,
    pub social: String,
}

pub struct ApifyClient {
    client: Client,
    token: String,
    base_url: String,
    actors: ApifyActors,
    poll_interval: Duration,
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActorRun {
    id: String,
    status: String,
    default_dataset_id: String,
    #[serde(default)]
    usage_total_usd: Option<f64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Dataset {
    #[serde(default)]
    item_count: u64,
}

impl ApifyClient {
    pub fn new(token: impl Into<String>, actors: ApifyActors) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to create Apify client")?;
        Ok(ApifyClient {
            client,
            token: token.into(),
            base_url: APIFY_API_URL.to_string(),
            actors,
            poll_interval: Duration::from_secs(5),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn send<R: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<R> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("Apify request failed: {what}"))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Apify API error ({what}): {status} - {text}"));
        }
        response
            .json()
            .await
            .with_context(|| format!("Invalid Apify response: {what}"))
    }

    async fn start_run(&self, actor: &str, input: &Value, max_charge: Usd, max_items: u64) -> Result<ActorRun> {
        let url = format!("{}/acts/{}/runs", self.base_url, actor_path(actor));
        let request = self
            .client
            .post(url)
            .query(&[
                ("maxTotalChargeUsd", max_charge.floor_dollars()),
                ("maxItems", max_items.to_string()),
            ])
            .json(input);
        let run: Envelope<ActorRun> = self.send(request, "start run").await?;
        Ok(run.data)
    }

    async fn get_run(&self, run_id: &str) -> Result<ActorRun> {
        let url = format!("{}/actor-runs/{}", self.base_url, run_id);
        let run: Envelope<ActorRun> = self.send(self.client.get(url), "get run").await?;
        Ok(run.data)
    }

    async fn abort_run(&self, run_id: &str) -> Result<()> {
        let url = format!("{}/actor-runs/{}/abort", self.base_url, run_id);
        let _: Envelope<ActorRun> = self.send(self.client.post(url), "abort run").await?;
        Ok(())
    }

    async fn dataset_size(&self, dataset_id: &str) -> Result<u64> {
        let url = format!("{}/datasets/{}", self.base_url, dataset_id);
        let dataset: Envelope<Dataset> = self.send(self.client.get(url), "get dataset").await?;
        Ok(dataset.data.item_count)
    }

    async fn dataset_items(&self, dataset_id: &str, limit: u64) -> Result<Vec<Value>> {
        let url = format!("{}/datasets/{}/items", self.base_url, dataset_id);
        let request = self.client.get(url).query(&[
            ("format", "json".to_string()),
            ("clean", "true".to_string()),
            ("limit", limit.to_string()),
        ]);
        self.send(request, "get dataset items").await
    }

    /// Starts one actor run and follows it to its end. A run that cannot be
    /// followed is aborted so it stops charging.
    async fn drive(&self, run: RunSpec<'_>, tracker: &mut Tracker, cancel: &CancellationToken) -> Result<(Vec<Value>, RunOutcome)> {
        let actor_run = self
            .start_run(run.actor, &run.input, run.max_charge, run.max_items)
            .await?;
        let run_id = actor_run.id.clone();
        info!(label = run.label, run_id = %run_id, "Apify run started");
        tracker.phase = format!("scraping-{}", run.label);
        tracker.run_ids.insert(run.label.to_string(), run_id.clone());
        tracker.publish();

        let result = self.follow(actor_run, &run, tracker, cancel).await;
        if let Err(err) = &result {
            warn!(run_id = %run_id, error = ?err, "Lost track of Apify run, aborting it");
            if let Err(err) = self.abort_run(&run_id).await {
                warn!(run_id = %run_id, error = ?err, "Could not abort Apify run");
            }
        }
        result
    }

    async fn follow(
        &self,
        mut actor_run: ActorRun,
        run: &RunSpec<'_>,
        tracker: &mut Tracker,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Value>, RunOutcome)> {
        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(err) = self.abort_run(&actor_run.id).await {
                        warn!(run_id = %actor_run.id, error = ?err, "Could not abort Apify run");
                    }
                    break RunOutcome::Aborted;
                },
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            actor_run = self.get_run(&actor_run.id).await?;
            let fetched = self.dataset_size(&actor_run.default_dataset_id).await?;
            tracker.counts.insert(run.label.to_string(), fetched.min(run.max_items));
            tracker.current_cost = Usd::from_dollars(actor_run.usage_total_usd.unwrap_or(0.0));
            tracker.publish();

            match actor_run.status.as_str() {
                "SUCCEEDED" => break RunOutcome::Succeeded,
                "FAILED" | "ABORTED" | "TIMED-OUT" => break RunOutcome::Failed(actor_run.status.clone()),
                _ => {}
            }
        };

        let items = self
            .dataset_items(&actor_run.default_dataset_id, run.max_items)
            .await?;
        tracker.finish_run();
        debug!(label = run.label, items = items.len(), ?outcome, "Apify run finished");
        Ok((items, outcome))
    }
}

struct RunSpec<'a> {
    label: &'a str,
    actor: &'a str,
    input: Value,
    max_charge: Usd,
    max_items: u64,
}

/// Running totals across the actor runs of one scrape.
struct Tracker {
    updates: UnboundedSender<ProviderUpdate>,
    phase: String,
    counts: BTreeMap<String, u64>,
    run_ids: BTreeMap<String, String>,
    settled_cost: Usd,
    current_cost: Usd,
}

impl Tracker {
    fn cost(&self) -> Usd {
        self.settled_cost.saturating_add(self.current_cost)
    }

    fn publish(&self) {
        let _ = self.updates.send(ProviderUpdate {
            phase: self.phase.clone(),
            counts: self.counts.clone(),
            accrued_cost: self.cost(),
            run_ids: self.run_ids.clone(),
        });
    }

    fn finish_run(&mut self) {
        self.settled_cost = self.cost();
        self.current_cost = Usd::ZERO;
    }
}

#[async_trait]
impl ScrapeProvider for ApifyClient {
    #[instrument(skip_all, fields(username = %params.username))]
    async fn run_scrape(
        &self,
        params: &ScrapeParams,
        updates: UnboundedSender<ProviderUpdate>,
        cancel: CancellationToken,
    ) -> Result<ScrapeOutput> {
        let mut tracker = Tracker {
            updates,
            phase: "starting".into(),
            counts: BTreeMap::new(),
            run_ids: BTreeMap::new(),
            settled_cost: Usd::ZERO,
            current_cost: Usd::ZERO,
        };
        let mut output = ScrapeOutput::empty(RunOutcome::Succeeded);

        let mut runs = Vec::new();
        if let Some(count) = params.timeline_count {
            runs.push(RunSpec {
                label: "timeline",
                actor: &self.actors.timeline,
                input: json!({
                    "twitterHandles": [params.username],
                    "maxItems": count,
                    "sort": "Latest",
                    "includeReplies": params.wants(ScrapeCategory::Replies),
                }),
                max_charge: params.timeline_budget,
                max_items: count,
            });
        }
        let social: Vec<ScrapeCategory> = [ScrapeCategory::Followers, ScrapeCategory::Following]
            .into_iter()
            .filter(|c| params.wants(*c))
            .collect();
        for (i, category) in social.iter().enumerate() {
            let share = |total: u64| split_evenly(total, social.len() as u64, i as u64);
            let max_items = share(params.social_max_items.unwrap_or(0));
            if max_items == 0 {
                continue;
            }
            runs.push(RunSpec {
                label: category.as_str(),
                actor: &self.actors.social,
                input: json!({
                    "user_names": [params.username],
                    "maxFollowers": if *category == ScrapeCategory::Followers { max_items } else { 0 },
                    "maxFollowings": if *category == ScrapeCategory::Following { max_items } else { 0 },
                    "getFollowers": *category == ScrapeCategory::Followers,
                    "getFollowing": *category == ScrapeCategory::Following,
                }),
                max_charge: Usd::from_micros(share(params.social_budget.micros())),
                max_items,
            });
        }

        for run in runs {
            let label = run.label;
            let (items, outcome) = match self.drive(run, &mut tracker, &cancel).await {
                Ok(result) => result,
                Err(err) if output.item_count() > 0 => {
                    warn!(label, error = ?err, "Apify run failed, keeping earlier results");
                    output.outcome = RunOutcome::Failed(err.to_string());
                    break;
                }
                Err(err) => return Err(err),
            };
            absorb(&mut output, label, items, params);
            output.outcome = combine(output.outcome, outcome);
            if output.outcome == RunOutcome::Aborted {
                break;
            }
        }

        if output.profile.is_none() {
            output.profile = Some(Profile {
                username: params.username.clone(),
                ..Default::default()
            });
        }
        output.run_ids = tracker.run_ids.clone();
        output.cost = tracker.cost();
        Ok(output)
    }
}

/// `username/actor-name` ids are addressed as `username~actor-name`.
fn actor_path(actor: &str) -> String {
    actor.replace('/', "~")
}

/// The `index`-th of `parts` shares of `total`, earlier shares taking the
/// remainder.
fn split_evenly(total: u64, parts: u64, index: u64) -> u64 {
    if parts == 0 {
        return 0;
    }
    total / parts + u64::from(index < total % parts)
}

fn combine(current: RunOutcome, next: RunOutcome) -> RunOutcome {
    match (current, next) {
        (RunOutcome::Aborted, _) | (_, RunOutcome::Aborted) => RunOutcome::Aborted,
        (RunOutcome::Failed(reason), _) | (_, RunOutcome::Failed(reason)) => RunOutcome::Failed(reason),
        _ => RunOutcome::Succeeded,
    }
}

fn absorb(output: &mut ScrapeOutput, label: &str, items: Vec<Value>, params: &ScrapeParams) {
    match label {
        "timeline" => {
            for item in items {
                let Ok(tweet) = serde_json::from_value::<TweetItem>(item) else {
                    continue;
                };
                if output.profile.is_none() {
                    output.profile = tweet.author.as_ref().and_then(to_profile);
                }
                let Some(post) = to_post(tweet) else { continue };
                if post.is_reply() {
                    if params.wants(ScrapeCategory::Replies) {
                        output.replies.push(post);
                    }
                } else if params.wants(ScrapeCategory::Posts) {
                    output.posts.push(post);
                }
            }
        }
        _ => {
            let follows = items
                .into_iter()
                .filter_map(|item| serde_json::from_value::<UserItem>(item).ok())
                .filter_map(to_follow);
            if label == ScrapeCategory::Followers.as_str() {
                output.followers.extend(follows);
            } else {
                output.following.extend(follows);
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct TweetItem {
    id: Option<Value>,
    text: Option<String>,
    full_text: Option<String>,
    created_at: Option<String>,
    url: Option<String>,
    in_reply_to_id: Option<Value>,
    in_reply_to_user_id: Option<Value>,
    in_reply_to_username: Option<String>,
    like_count: u64,
    retweet_count: u64,
    author: Option<UserItem>,
    extended_entities: Option<Entities>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Entities {
    media: Vec<EntityMedia>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EntityMedia {
    media_url_https: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    video_info: Option<VideoInfo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VideoInfo {
    variants: Vec<VideoVariant>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VideoVariant {
    url: Option<String>,
    bitrate: Option<u64>,
    content_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct UserItem {
    id: Option<Value>,
    #[serde(alias = "screen_name", alias = "username")]
    user_name: Option<String>,
    name: Option<String>,
    description: Option<String>,
    location: Option<String>,
    url: Option<String>,
    profile_picture: Option<String>,
    cover_picture: Option<String>,
    created_at: Option<String>,
}

fn text(value: &Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn to_profile(author: &UserItem) -> Option<Profile> {
    Some(Profile {
        account_id: text(&author.id),
        username: author.user_name.clone().filter(|u| !u.is_empty())?,
        display_name: author.name.clone(),
        bio: author.description.clone().filter(|s| !s.is_empty()),
        website: None,
        location: author.location.clone().filter(|s| !s.is_empty()),
        avatar_url: author.profile_picture.clone(),
        header_url: author.cover_picture.clone(),
        created_at: author.created_at.clone(),
    })
}

fn to_media(media: EntityMedia) -> Option<MediaRef> {
    let video = media.video_info.and_then(|info| {
        info.variants
            .into_iter()
            .filter(|v| v.content_type.as_deref() == Some("video/mp4"))
            .max_by_key(|v| v.bitrate.unwrap_or(0))
            .and_then(|v| v.url)
    });
    Some(MediaRef {
        url: video.or(media.media_url_https)?,
        kind: media.kind,
    })
}

fn to_post(tweet: TweetItem) -> Option<Post> {
    let id = text(&tweet.id)?;
    let username = tweet.author.as_ref().and_then(|a| a.user_name.clone());
    let reply_to = text(&tweet.in_reply_to_id).map(|post_id| ReplyRef {
            post_id,
            user_id: text(&tweet.in_reply_to_user_id),
            username: tweet.in_reply_to_username.clone(),
        });
    let media = tweet
        .extended_entities
        .map(|entities| entities.media.into_iter().filter_map(to_media).collect())
        .unwrap_or_default();
    Some(Post {
        permalink: tweet
            .url
            .or_else(|| snapshot::permalink(username.as_deref(), &id)),
        id,
        text: tweet.full_text.or(tweet.text).unwrap_or_default(),
        created_at: tweet.created_at,
        reply_to,
        media,
        like_count: tweet.like_count,
        repost_count: tweet.retweet_count,
    })
}

fn to_follow(user: UserItem) -> Option<Follow> {
    let account_id = text(&user.id)?;
    let profile_url = user
        .url
        .or_else(|| user.user_name.as_ref().map(|u| format!("https://x.com/{u}")));
    Some(Follow {
        account_id,
        username: user.user_name,
        profile_url,
    })
}
