//! Hello-token authentication.

use std::collections::HashMap;

use voxlink_common::UserId;

/// Maps bearer tokens to user ids.
///
/// An empty map runs in dev mode: the token itself is taken as the user id.
#[derive(Debug, Clone, Default)]
pub struct TokenMap {
    tokens: HashMap<String, UserId>,
}

impl TokenMap {
    /// Build from `TOKEN=USER` pairs.
    pub fn from_args(args: &[String]) -> Result<Self, String> {
        let mut tokens = HashMap::new();
        for arg in args {
            let (token, user) = parse_token_arg(arg)?;
            tokens.insert(token, user);
        }
        Ok(Self { tokens })
    }

    pub fn is_dev_mode(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn authenticate(&self, token: &str) -> Option<UserId> {
        let user = if self.is_dev_mode() {
            UserId::from(token)
        } else {
            self.tokens.get(token)?.clone()
        };
        user.is_valid().then_some(user)
    }
}

fn parse_token_arg(arg: &str) -> Result<(String, UserId), String> {
    let (token, user) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected TOKEN=USER, got {arg:?}"))?;
    let user = UserId::from(user.trim());
    if token.trim().is_empty() || !user.is_valid() {
        return Err(format!("expected TOKEN=USER, got {arg:?}"));
    }
    Ok((token.trim().to_string(), user))
}
