use std::collections::BTreeMap;
use std::collections::HashMap;

use autorouter_storage::{RequestStatRow, SnapshotStatRow};
use time::{OffsetDateTime, Time};

/// Admin stats ranges; `today` buckets by hour, the rest by day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsRange {
    Today,
    Week,
    Month,
}

impl StatsRange {
    pub fn parse(value: Option<&str>) -> Option<Self> {
        match value.unwrap_or("today") {
            "today" => Some(StatsRange::Today),
            "7d" => Some(StatsRange::Week),
            "30d" => Some(StatsRange::Month),
            _ => None,
        }
    }

    pub fn since(self, now: OffsetDateTime) -> OffsetDateTime {
        match self {
            StatsRange::Today => now
                .to_offset(time::UtcOffset::UTC)
                .replace_time(Time::MIDNIGHT),
            StatsRange::Week => now - time::Duration::days(7),
            StatsRange::Month => now - time::Duration::days(30),
        }
    }

    pub fn granularity(self) -> &'static str {
        match self {
            StatsRange::Today => "hour",
            StatsRange::Week | StatsRange::Month => "day",
        }
    }
}

pub fn overview(
    range: StatsRange,
    requests: &[RequestStatRow],
    snapshots: &[SnapshotStatRow],
) -> serde_json::Value {
    let total_requests = requests.len() as i64;
    let error_count = requests
        .iter()
        .filter(|row| row.status_code.map(|status| status >= 400).unwrap_or(true))
        .count() as i64;
    let stream_count = requests.iter().filter(|row| row.is_stream).count() as i64;
    let failover_count = requests
        .iter()
        .filter(|row| row.failover_attempts > 1)
        .count() as i64;

    let avg = |values: Vec<i64>| -> Option<i64> {
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<i64>() / values.len() as i64)
        }
    };
    let avg_duration_ms = avg(requests.iter().map(|row| row.duration_ms).collect());
    let avg_ttft_ms = avg(requests.iter().filter_map(|row| row.ttft_ms).collect());

    let billed_count = snapshots
        .iter()
        .filter(|row| row.billing_status == "billed")
        .count() as i64;
    let unbilled_count = snapshots.len() as i64 - billed_count;
    let total_cost: f64 = snapshots.iter().map(|row| row.final_cost).sum();
    let prompt_tokens: i64 = snapshots.iter().map(|row| row.prompt_tokens).sum();
    let completion_tokens: i64 = snapshots.iter().map(|row| row.completion_tokens).sum();

    serde_json::json!({
        "range": range_name(range),
        "total_requests": total_requests,
        "success_count": total_requests - error_count,
        "error_count": error_count,
        "stream_count": stream_count,
        "failover_count": failover_count,
        "avg_duration_ms": avg_duration_ms,
        "avg_ttft_ms": avg_ttft_ms,
        "total_cost": total_cost,
        "billed_count": billed_count,
        "unbilled_count": unbilled_count,
        "prompt_tokens": prompt_tokens,
        "completion_tokens": completion_tokens,
    })
}

pub fn timeseries(
    range: StatsRange,
    requests: &[RequestStatRow],
    snapshots: &[SnapshotStatRow],
) -> serde_json::Value {
    #[derive(Default)]
    struct Bucket {
        requests: i64,
        errors: i64,
        cost: f64,
        prompt_tokens: i64,
        completion_tokens: i64,
    }

    let mut buckets: BTreeMap<String, Bucket> = BTreeMap::new();
    for row in requests {
        let bucket = buckets.entry(bucket_key(range, row.created_at)).or_default();
        bucket.requests += 1;
        if row.status_code.map(|status| status >= 400).unwrap_or(true) {
            bucket.errors += 1;
        }
    }
    for row in snapshots {
        let bucket = buckets.entry(bucket_key(range, row.created_at)).or_default();
        bucket.cost += row.final_cost;
        bucket.prompt_tokens += row.prompt_tokens;
        bucket.completion_tokens += row.completion_tokens;
    }

    let data: Vec<serde_json::Value> = buckets
        .into_iter()
        .map(|(bucket, value)| {
            serde_json::json!({
                "bucket": bucket,
                "requests": value.requests,
                "errors": value.errors,
                "cost": value.cost,
                "prompt_tokens": value.prompt_tokens,
                "completion_tokens": value.completion_tokens,
            })
        })
        .collect();

    serde_json::json!({
        "range": range_name(range),
        "granularity": range.granularity(),
        "data": data,
    })
}

pub fn leaderboard(
    range: StatsRange,
    requests: &[RequestStatRow],
    snapshots: &[SnapshotStatRow],
    upstream_names: &HashMap<i64, String>,
) -> serde_json::Value {
    #[derive(Default)]
    struct Line {
        requests: i64,
        cost: f64,
        prompt_tokens: i64,
        completion_tokens: i64,
    }

    let mut models: HashMap<String, Line> = HashMap::new();
    let mut upstreams: HashMap<i64, Line> = HashMap::new();

    for row in requests {
        if let Some(model) = &row.model {
            models.entry(model.clone()).or_default().requests += 1;
        }
        if let Some(upstream_id) = row.upstream_id {
            upstreams.entry(upstream_id).or_default().requests += 1;
        }
    }
    for row in snapshots {
        if let Some(model) = &row.model {
            let line = models.entry(model.clone()).or_default();
            line.cost += row.final_cost;
            line.prompt_tokens += row.prompt_tokens;
            line.completion_tokens += row.completion_tokens;
        }
        if let Some(upstream_id) = row.upstream_id {
            let line = upstreams.entry(upstream_id).or_default();
            line.cost += row.final_cost;
        }
    }

    let mut model_rows: Vec<_> = models.into_iter().collect();
    model_rows.sort_by(|a, b| b.1.cost.total_cmp(&a.1.cost).then(b.1.requests.cmp(&a.1.requests)));
    let mut upstream_rows: Vec<_> = upstreams.into_iter().collect();
    upstream_rows
        .sort_by(|a, b| b.1.cost.total_cmp(&a.1.cost).then(b.1.requests.cmp(&a.1.requests)));

    serde_json::json!({
        "range": range_name(range),
        "models": model_rows
            .into_iter()
            .map(|(model, line)| serde_json::json!({
                "model": model,
                "requests": line.requests,
                "cost": line.cost,
                "prompt_tokens": line.prompt_tokens,
                "completion_tokens": line.completion_tokens,
            }))
            .collect::<Vec<_>>(),
        "upstreams": upstream_rows
            .into_iter()
            .map(|(upstream_id, line)| serde_json::json!({
                "upstream_id": upstream_id,
                "name": upstream_names.get(&upstream_id),
                "requests": line.requests,
                "cost": line.cost,
            }))
            .collect::<Vec<_>>(),
    })
}

fn range_name(range: StatsRange) -> &'static str {
    match range {
        StatsRange::Today => "today",
        StatsRange::Week => "7d",
        StatsRange::Month => "30d",
    }
}

fn bucket_key(range: StatsRange, at: OffsetDateTime) -> String {
    let at = at.to_offset(time::UtcOffset::UTC);
    match range.granularity() {
        "hour" => format!(
            "{:04}-{:02}-{:02}T{:02}:00:00Z",
            at.year(),
            u8::from(at.month()),
            at.day(),
            at.hour()
        ),
        _ => format!(
            "{:04}-{:02}-{:02}",
            at.year(),
            u8::from(at.month()),
            at.day()
        ),
    }
}
