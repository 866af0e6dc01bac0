//! Human-readable rendering of control replies.

use std::fmt::Write;

use chrono::{DateTime, Local};
use drover::ipc::{ListReply, PastReply, PushReply, StatsReply};

fn format_timestamp(timestamp: f64) -> String {
  let secs = timestamp.trunc() as i64;
  let nanos = ((timestamp.fract() * 1e9) as u32).min(999_999_999);
  DateTime::from_timestamp(secs, nanos)
    .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S%.3f").to_string())
    .unwrap_or_else(|| format!("{timestamp:.3}"))
}

pub fn format_push(reply: &PushReply) -> String {
  format!("{} [{}]\n{}", reply.driver, reply.ticket, pretty(&reply.result))
}

pub fn format_past(driver: &str, reply: &PastReply) -> String {
  let mut out = String::new();
  let _ = writeln!(out, "{driver}: {} result(s)", reply.entries.len());
  for entry in &reply.entries {
    let _ = writeln!(out, "  {}  {}", format_timestamp(entry.timestamp()), entry.result());
  }
  out
}

pub fn format_stats(reply: &StatsReply) -> String {
  let mut out = String::new();
  let _ = writeln!(out, "Engines:        {} running", reply.engines.len());
  for engine in &reply.engines {
    let _ = writeln!(
      out,
      "                - {engine}: {} queued, {} worker(s)",
      reply.queue_depths.get(engine).copied().unwrap_or(0),
      reply.workers.get(engine).copied().unwrap_or(0)
    );
  }
  let _ = writeln!(out, "Pending jobs:   {}", reply.pending_jobs);
  let _ = writeln!(out, "Histories:      {}", reply.histories);
  out
}

pub fn format_list(reply: &ListReply) -> String {
  let mut out = String::new();
  if reply.engines.is_empty() {
    let _ = writeln!(out, "No engines configured");
  }
  for engine in &reply.engines {
    match reply.running.get(engine) {
      Some(endpoints) => {
        let endpoints: Vec<String> = endpoints.iter().map(ToString::to_string).collect();
        let _ = writeln!(out, "{engine}  running  {}", endpoints.join(", "));
      }
      None => {
        let _ = writeln!(out, "{engine}  idle");
      }
    }
  }
  out
}

fn pretty(value: &serde_json::Value) -> String {
  serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
