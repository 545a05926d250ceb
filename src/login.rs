//! Boot-to-login timing left behind by the session manager.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::error::{CujError, Result};

pub const DEFAULT_LOGIN_TIME_FILE: &str = "/tmp/login-times-sent";
pub const LOGIN_TIME_METRIC: &str = "User.LoginTime";

static LOGIN_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"BootTime\.(LoginNewUser|Login):\s*([0-9]+(?:\.[0-9]+)?)")
        .expect("login time pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginKind {
    LoginNewUser,
    Login,
}

impl LoginKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginKind::LoginNewUser => "LoginNewUser",
            LoginKind::Login => "Login",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoginTime {
    pub kind: LoginKind,
    pub seconds: f64,
}

/// Parse the first line of a login-time file.
pub fn parse(contents: &str) -> Result<LoginTime> {
    let first = contents.lines().next().unwrap_or_default();
    let captures = LOGIN_LINE
        .captures(first)
        .ok_or_else(|| CujError::failed(format!("unrecognised login time line: {first:?}")))?;
    let kind = match &captures[1] {
        "LoginNewUser" => LoginKind::LoginNewUser,
        _ => LoginKind::Login,
    };
    let seconds = captures[2]
        .parse::<f64>()
        .map_err(|err| CujError::failed(format!("bad login time {:?}: {err}", &captures[2])))?;
    Ok(LoginTime { kind, seconds })
}

/// Read and parse `path`; a missing file yields `None`.
pub async fn snapshot(path: &Path) -> Result<Option<LoginTime>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no login time file");
            return Ok(None);
        }
        Err(err) => return Err(err.into()),
    };
    parse(&contents).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_kinds() {
        let new_user = parse("BootTime.LoginNewUser: 12.5\nother\n").unwrap();
        assert_eq!(new_user.kind, LoginKind::LoginNewUser);
        assert_eq!(new_user.seconds, 12.5);

        let login = parse("BootTime.Login: 7").unwrap();
        assert_eq!(login.kind, LoginKind::Login);
        assert_eq!(login.seconds, 7.0);
    }

    #[test]
    fn only_first_line_counts() {
        assert!(parse("garbage\nBootTime.Login: 7\n").is_err());
    }

    #[tokio::test]
    async fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(snapshot(&dir.path().join("absent")).await.unwrap(), None);

        let path = dir.path().join("login-times-sent");
        std::fs::write(&path, "BootTime.Login: 3.25\n").unwrap();
        let parsed = snapshot(&path).await.unwrap().unwrap();
        assert_eq!(parsed.seconds, 3.25);
    }
}
