//! Client configuration
//!
//! `ClientOptions` is decoded from JSON with explicit serde defaults. The
//! connection address is parsed with nom into an `Endpoint`:
//!
//! ```text
//! [scheme://][user[:password]@]host[:port][/database]
//! ```

use crate::error::{DbQueueError, Result};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, digit1},
    combinator::{all_consuming, map_res, opt, rest},
    error::{Error as NomError, ErrorKind},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

/// Login for the backing store
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Options shared by the key-value and document clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Client name, used to name worker threads
    pub name: String,
    pub address: String,
    pub credentials: Option<Credentials>,
    pub database: Option<String>,
    /// Connections the driver may hold open, handed to the driver factory
    /// by `KvClient::connect` and `DocClient::connect`
    pub pool_size: usize,
    pub worker_count: usize,
    pub queue_capacity: usize,
    /// Upper bound on documents returned by a find-all
    pub find_max_count: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            name: "dbqueue".to_string(),
            address: "127.0.0.1".to_string(),
            credentials: None,
            database: None,
            pool_size: 10,
            worker_count: 10,
            queue_capacity: 1000,
            find_max_count: 500,
        }
    }
}

impl ClientOptions {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| DbQueueError::Configuration(format!("invalid client options: {}", e)))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| {
            DbQueueError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Check bounds and resolve the address.
    ///
    /// Credentials and database given explicitly in the options fill in
    /// whatever the address leaves out.
    pub fn validate(&self) -> Result<Endpoint> {
        let bounds = [
            ("worker_count", self.worker_count),
            ("queue_capacity", self.queue_capacity),
            ("pool_size", self.pool_size),
            ("find_max_count", self.find_max_count),
        ];
        if let Some((field, _)) = bounds.iter().find(|(_, value)| *value == 0) {
            return Err(DbQueueError::Configuration(format!("{} must be at least 1", field)));
        }
        if self.name.trim().is_empty() {
            return Err(DbQueueError::Configuration("client name is empty".to_string()));
        }

        let mut endpoint = Endpoint::parse(&self.address)?;
        if endpoint.username.is_none() {
            if let Some(credentials) = &self.credentials {
                endpoint.username = Some(credentials.username.clone());
                endpoint.password = Some(credentials.password.clone());
            }
        }
        if endpoint.database.is_none() {
            endpoint.database = self.database.clone();
        }
        Ok(endpoint)
    }
}

/// A parsed store address
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub database: Option<String>,
}

impl Endpoint {
    pub fn parse(address: &str) -> Result<Self> {
        let address = address.trim();
        if address.is_empty() {
            return Err(DbQueueError::Configuration("address is empty".to_string()));
        }
        let (_, endpoint) = all_consuming(endpoint)(address)?;
        Ok(endpoint)
    }

    /// `host` or `host:port`, with IPv6 hosts bracketed
    pub fn authority(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match self.port {
            Some(port) => format!("{}:{}", host, port),
            None => host,
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("scheme", &self.scheme)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .finish()
    }
}

fn scheme(input: &str) -> IResult<&str, &str> {
    terminated(
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.'),
        tag("://"),
    )(input)
}

/// `[user][:password]@`, split at the last `@` so a password may itself
/// contain `@`, `/` or `:`.
fn userinfo(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    let at = input
        .rfind('@')
        .ok_or_else(|| nom::Err::Error(NomError::new(input, ErrorKind::Char)))?;
    let (info, remainder) = (&input[..at], &input[at + 1..]);
    let (_, credentials) = all_consuming(pair(
        take_while(|c: char| c != ':'),
        opt(preceded(char(':'), rest)),
    ))(info)?;
    Ok((remainder, credentials))
}

/// A name or IPv4 address, or a bracketed IPv6 address
fn host(input: &str) -> IResult<&str, &str> {
    alt((
        delimited(char('['), take_while1(|c: char| c != ']'), char(']')),
        take_while1(|c: char| c != ':' && c != '/' && c != '@' && c != '['),
    ))(input)
}

fn port(input: &str) -> IResult<&str, u16> {
    preceded(char(':'), map_res(digit1, str::parse::<u16>))(input)
}

fn database(input: &str) -> IResult<&str, &str> {
    preceded(char('/'), take_while1(|c: char| c != '/'))(input)
}

fn endpoint(input: &str) -> IResult<&str, Endpoint> {
    let (rest, (scheme, userinfo, host, port, database)) = tuple((
        opt(scheme),
        opt(userinfo),
        host,
        opt(port),
        opt(database),
    ))(input)?;

    let (username, password) = match userinfo {
        Some((user, password)) => (
            Some(user).filter(|user| !user.is_empty()).map(str::to_string),
            password.map(str::to_string),
        ),
        None => (None, None),
    };
    Ok((
        rest,
        Endpoint {
            scheme: scheme.map(str::to_string),
            username,
            password,
            host: host.to_string(),
            port,
            database: database.map(str::to_string),
        },
    ))
}
