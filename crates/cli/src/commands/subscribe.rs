//! Follow the publication socket

use anyhow::{Context, Result};
use drover::ipc::{IpcError, Subscriber};

use super::Target;

pub async fn cmd_subscribe(target: &Target, publish: Option<&str>, driver: Option<&str>) -> Result<()> {
  let addr = match publish {
    Some(addr) => addr.to_string(),
    None => target.load_config()?.core.publish,
  };

  let mut subscriber = Subscriber::connect(addr.as_str())
    .await
    .with_context(|| format!("Failed to connect to {addr}"))?;

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => return Ok(()),

      received = subscriber.next() => match received {
        Ok(publication) => {
          if driver.is_some_and(|d| d != publication.driver) {
            continue;
          }
          println!("{} {}", publication.driver, publication.result);
        }
        Err(IpcError::Shutdown) => {
          eprintln!("Daemon closed the publication socket");
          return Ok(());
        }
        Err(e) => return Err(e).context("Subscription failed"),
      },
    }
  }
}
