//! Control requests: push, drop, past, stats, list, route

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;

use super::Target;
use crate::format::{format_list, format_past, format_push, format_stats};

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

/// Push a job and wait for its result
pub async fn cmd_push(target: &Target, engine: &str, method: &str, args: Option<&str>, json: bool) -> Result<()> {
  let args: Value = match args {
    Some(raw) => serde_json::from_str(raw).context("Arguments must be valid JSON")?,
    None => Value::Object(Default::default()),
  };

  let client = target.connect().await?;
  let reply = client.push(engine, method, args).await.context("Push failed")?;

  if json {
    return print_json(&reply);
  }
  println!("{}", format_push(&reply));
  Ok(())
}

pub async fn cmd_drop(target: &Target, engine: &str) -> Result<()> {
  let client = target.connect().await?;
  client.drop_engine(engine).await.context("Drop failed")?;
  println!("Dropped engine {engine}");
  Ok(())
}

pub async fn cmd_past(target: &Target, driver: &str, json: bool) -> Result<()> {
  let client = target.connect().await?;
  let reply = client.past(driver).await.context("Failed to get history")?;

  if json {
    return print_json(&reply);
  }
  print!("{}", format_past(driver, &reply));
  Ok(())
}

pub async fn cmd_stats(target: &Target, json: bool) -> Result<()> {
  let client = target.connect().await?;
  let reply = client.stats().await.context("Failed to get stats")?;

  if json {
    return print_json(&reply);
  }
  print!("{}", format_stats(&reply));
  Ok(())
}

pub async fn cmd_list(target: &Target, json: bool) -> Result<()> {
  let client = target.connect().await?;
  let reply = client.list().await.context("Failed to list engines")?;

  if json {
    return print_json(&reply);
  }
  print!("{}", format_list(&reply));
  Ok(())
}

pub async fn cmd_route(target: &Target, group: &str, key: Option<&str>) -> Result<()> {
  let client = target.connect().await?;
  let reply = client.route(group, key).await.context("Routing failed")?;
  println!("{}", reply.backend);
  Ok(())
}
