//! Request verification.

use crate::ipc::Request;

/// Decides whether a control request may run.
///
/// Implementations see the decoded request including its credentials and
/// return the reason for a rejection.
pub trait Verifier: Send + Sync {
  fn verify(&self, request: &Request) -> Result<(), String>;
}

/// Accepts every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Verifier for AllowAll {
  fn verify(&self, _request: &Request) -> Result<(), String> {
    Ok(())
  }
}

/// Requires credentials naming one of the listed users.
///
/// Signatures are not checked; this only gates who may talk to the daemon.
#[derive(Debug, Default, Clone)]
pub struct KnownUsers {
  users: Vec<String>,
}

impl KnownUsers {
  pub fn new(users: impl IntoIterator<Item = impl Into<String>>) -> Self {
    Self {
      users: users.into_iter().map(Into::into).collect(),
    }
  }
}

impl Verifier for KnownUsers {
  fn verify(&self, request: &Request) -> Result<(), String> {
    match &request.credentials {
      Some(credentials) if self.users.contains(&credentials.username) => Ok(()),
      Some(credentials) => Err(format!("unknown user {}", credentials.username)),
      None => Err("credentials required".to_string()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ipc::{Action, Credentials};

  #[test]
  fn test_known_users() {
    let verifier = KnownUsers::new(["ops"]);

    let mut request = Request::new(Action::Stats);
    assert!(verifier.verify(&request).is_err());

    request.credentials = Some(Credentials {
      username: "ops".to_string(),
      signature: String::new(),
    });
    assert!(verifier.verify(&request).is_ok());

    request.credentials = Some(Credentials {
      username: "guest".to_string(),
      signature: String::new(),
    });
    assert_eq!(verifier.verify(&request).unwrap_err(), "unknown user guest");

    assert!(AllowAll.verify(&request).is_ok());
  }
}
