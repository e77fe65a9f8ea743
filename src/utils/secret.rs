use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use url::Url;

/// Wrapper that keeps credentials (database urls, master keys) out of logs.
#[derive(Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Secret<S>(S)
where
    S: fmt::Debug + AsRef<str>;

impl<S> Secret<S>
where
    S: fmt::Debug + AsRef<str>,
{
    pub fn new(value: S) -> Secret<S> {
        Secret(value)
    }

    pub fn expose(&self) -> &str {
        self.0.as_ref()
    }
}

impl<S> fmt::Debug for Secret<S>
where
    S: fmt::Debug + AsRef<str>,
{
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("**********")
    }
}

impl<S> fmt::Display for Secret<S>
where
    S: fmt::Debug + AsRef<str>,
{
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("**********")
    }
}

impl FromStr for Secret<Url> {
    type Err = <Url as FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Url::from_str(s).map(Secret::new)
    }
}

impl FromStr for Secret<String> {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Secret::new(s.to_string()))
    }
}

pub type SecretUrl = Secret<Url>;
pub type SecretString = Secret<String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expose() {
        let secret = Secret(String::from("password@something!"));
        assert_eq!(secret.expose(), "password@something!");
    }

    #[test]
    fn test_debug() {
        let secret = Secret(String::from("password@something!"));
        assert_eq!(format!("{:?}", secret), "**********");
    }
}
