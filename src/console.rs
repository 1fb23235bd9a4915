//! Interactive debug console
//!
//! Lines are tokenized with nom (whitespace separated, double quotes group a
//! token containing spaces), mapped to a `ConsoleCommand`, and run through a
//! `KvClient` like any other caller would. Replies render in the familiar
//! key-value CLI style. `serve` exposes the console to telnet-style clients
//! over TCP, one session per connection.

use crate::error::{DbQueueError, Result};
use crate::kv::{KvClient, ScoredMember};
use crate::reply::{channel, Reply};
use nom::{
    branch::alt,
    bytes::complete::{take_while, take_while1},
    character::complete::{char, multispace0, multispace1},
    combinator::all_consuming,
    multi::separated_list0,
    sequence::delimited,
    IResult,
};
use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

/// Commands understood by the console
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Get { key: String },
    Set { key: String, value: String, ttl: Option<Duration> },
    Del { key: String },
    Keys { pattern: String },
    Expire { key: String, ttl: Duration },
    HGet { key: String, field: String },
    HSet { key: String, field: String, value: String },
    HGetAll { key: String },
    HIncrBy { key: String, field: String, delta: i64 },
    LPush { key: String, values: Vec<String> },
    RPush { key: String, values: Vec<String> },
    LPop { key: String },
    RPop { key: String },
    LRange { key: String, start: i64, stop: i64 },
    ZAdd { key: String, score: f64, member: String },
    ZIncrBy { key: String, increment: f64, member: String },
    ZRevRange { key: String, start: i64, stop: i64 },
    ZRevRank { key: String, member: String },
    SAdd { key: String, members: Vec<String> },
    SMembers { key: String },
    SIsMember { key: String, member: String },
    Stats,
    Help,
    Quit,
}

const VERBS: &[&str] = &[
    "GET", "SET", "DEL", "KEYS", "EXPIRE", "HGET", "HSET", "HGETALL", "HINCRBY", "LPUSH", "RPUSH",
    "LPOP", "RPOP", "LRANGE", "ZADD", "ZINCRBY", "ZREVRANGE", "ZREVRANK", "SADD", "SMEMBERS",
    "SISMEMBER", "STATS", "HELP", "QUIT", "EXIT",
];

pub const HELP: &str = "\
Available commands:
  GET key                      SET key value [EX seconds]
  DEL key                      KEYS pattern
  EXPIRE key seconds
  HGET key field               HSET key field value
  HGETALL key                  HINCRBY key field delta
  LPUSH key value...           RPUSH key value...
  LPOP key                     RPOP key
  LRANGE key start stop
  ZADD key score member        ZINCRBY key increment member
  ZREVRANGE key start stop     ZREVRANK key member
  SADD key member...           SMEMBERS key
  SISMEMBER key member
  STATS                        HELP
  QUIT";

fn quoted(input: &str) -> IResult<&str, &str> {
    delimited(char('"'), take_while(|c: char| c != '"'), char('"'))(input)
}

fn bare(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace() && c != '"')(input)
}

fn tokens(input: &str) -> IResult<&str, Vec<&str>> {
    delimited(
        multispace0,
        separated_list0(multispace1, alt((quoted, bare))),
        multispace0,
    )(input)
}

fn number<T: FromStr>(token: &str) -> Result<T> {
    token
        .parse()
        .map_err(|_| DbQueueError::Console(format!("not a number: {}", token)))
}

fn owned(tokens: &[&str]) -> Vec<String> {
    tokens.iter().map(|t| t.to_string()).collect()
}

/// Parse one console line
pub fn parse_line(line: &str) -> Result<ConsoleCommand> {
    let (_, tokens) = all_consuming(tokens)(line)
        .map_err(|e| DbQueueError::Console(format!("cannot tokenize line: {:?}", e)))?;
    let Some((verb, args)) = tokens.split_first() else {
        return Err(DbQueueError::Console("empty line".to_string()));
    };
    let verb = verb.to_ascii_uppercase();

    let command = match (verb.as_str(), args) {
        ("GET", [key]) => ConsoleCommand::Get { key: key.to_string() },
        ("SET", [key, value]) => ConsoleCommand::Set {
            key: key.to_string(),
            value: value.to_string(),
            ttl: None,
        },
        ("SET", [key, value, ex, seconds]) if ex.eq_ignore_ascii_case("EX") => ConsoleCommand::Set {
            key: key.to_string(),
            value: value.to_string(),
            ttl: Some(Duration::from_secs(number(seconds)?)),
        },
        ("DEL", [key]) => ConsoleCommand::Del { key: key.to_string() },
        ("KEYS", [pattern]) => ConsoleCommand::Keys { pattern: pattern.to_string() },
        ("EXPIRE", [key, seconds]) => ConsoleCommand::Expire {
            key: key.to_string(),
            ttl: Duration::from_secs(number(seconds)?),
        },
        ("HGET", [key, field]) => ConsoleCommand::HGet {
            key: key.to_string(),
            field: field.to_string(),
        },
        ("HSET", [key, field, value]) => ConsoleCommand::HSet {
            key: key.to_string(),
            field: field.to_string(),
            value: value.to_string(),
        },
        ("HGETALL", [key]) => ConsoleCommand::HGetAll { key: key.to_string() },
        ("HINCRBY", [key, field, delta]) => ConsoleCommand::HIncrBy {
            key: key.to_string(),
            field: field.to_string(),
            delta: number(delta)?,
        },
        ("LPUSH", [key, values @ ..]) if !values.is_empty() => ConsoleCommand::LPush {
            key: key.to_string(),
            values: owned(values),
        },
        ("RPUSH", [key, values @ ..]) if !values.is_empty() => ConsoleCommand::RPush {
            key: key.to_string(),
            values: owned(values),
        },
        ("LPOP", [key]) => ConsoleCommand::LPop { key: key.to_string() },
        ("RPOP", [key]) => ConsoleCommand::RPop { key: key.to_string() },
        ("LRANGE", [key, start, stop]) => ConsoleCommand::LRange {
            key: key.to_string(),
            start: number(start)?,
            stop: number(stop)?,
        },
        ("ZADD", [key, score, member]) => ConsoleCommand::ZAdd {
            key: key.to_string(),
            score: number(score)?,
            member: member.to_string(),
        },
        ("ZINCRBY", [key, increment, member]) => ConsoleCommand::ZIncrBy {
            key: key.to_string(),
            increment: number(increment)?,
            member: member.to_string(),
        },
        ("ZREVRANGE", [key, start, stop]) => ConsoleCommand::ZRevRange {
            key: key.to_string(),
            start: number(start)?,
            stop: number(stop)?,
        },
        ("ZREVRANK", [key, member]) => ConsoleCommand::ZRevRank {
            key: key.to_string(),
            member: member.to_string(),
        },
        ("SADD", [key, members @ ..]) if !members.is_empty() => ConsoleCommand::SAdd {
            key: key.to_string(),
            members: owned(members),
        },
        ("SMEMBERS", [key]) => ConsoleCommand::SMembers { key: key.to_string() },
        ("SISMEMBER", [key, member]) => ConsoleCommand::SIsMember {
            key: key.to_string(),
            member: member.to_string(),
        },
        ("STATS", []) => ConsoleCommand::Stats,
        ("HELP", []) => ConsoleCommand::Help,
        ("QUIT", []) | ("EXIT", []) => ConsoleCommand::Quit,
        (verb, _) if VERBS.contains(&verb) => {
            return Err(DbQueueError::Console(format!(
                "wrong number of arguments for {}",
                verb
            )))
        }
        (verb, _) => return Err(DbQueueError::Console(format!("unknown command {}", verb))),
    };
    Ok(command)
}

async fn wait<T>(rx: oneshot::Receiver<Reply<T>>, kind: &'static str) -> Result<Reply<T>> {
    rx.await.map_err(|_| DbQueueError::Stopped(kind))
}

fn render<T>(reply: Reply<T>, show: impl FnOnce(T) -> String) -> String {
    match reply.error {
        None => show(reply.value),
        Some(err) if err.is_not_found() => "(nil)".to_string(),
        Some(err) => format!("(error) {}", err),
    }
}

fn string(value: impl Display) -> String {
    format!("\"{}\"", value)
}

fn integer(value: impl Display) -> String {
    format!("(integer) {}", value)
}

fn list(items: Vec<String>) -> String {
    if items.is_empty() {
        return "(empty list)".to_string();
    }
    items
        .iter()
        .enumerate()
        .map(|(i, item)| format!("{}) {}", i + 1, string(item)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn hash(fields: HashMap<String, String>) -> String {
    let mut pairs: Vec<_> = fields.into_iter().collect();
    pairs.sort();
    list(pairs.into_iter().flat_map(|(field, value)| [field, value]).collect())
}

fn scored(members: Vec<ScoredMember>) -> String {
    list(
        members
            .into_iter()
            .flat_map(|m| [m.member, m.score.to_string()])
            .collect(),
    )
}

/// Run one command through `client` and render its reply
pub async fn execute(client: &KvClient, command: ConsoleCommand) -> Result<String> {
    let output = match command {
        ConsoleCommand::Get { key } => {
            let (callback, rx) = channel();
            client.get(key, callback)?;
            render(wait(rx, "get").await?, string)
        }
        ConsoleCommand::Set { key, value, ttl } => {
            let (callback, rx) = channel();
            client.set(key, value, ttl, callback)?;
            render(wait(rx, "set").await?, |_| "OK".to_string())
        }
        ConsoleCommand::Del { key } => {
            let (callback, rx) = channel();
            client.del(key, callback)?;
            render(wait(rx, "del").await?, integer)
        }
        ConsoleCommand::Keys { pattern } => {
            let (callback, rx) = channel();
            client.keys(pattern, callback)?;
            render(wait(rx, "keys").await?, list)
        }
        ConsoleCommand::Expire { key, ttl } => {
            let (callback, rx) = channel();
            client.expire(key, ttl, callback)?;
            render(wait(rx, "expire").await?, |set| integer(u8::from(set)))
        }
        ConsoleCommand::HGet { key, field } => {
            let (callback, rx) = channel();
            client.hget(key, field, callback)?;
            render(wait(rx, "hget").await?, string)
        }
        ConsoleCommand::HSet { key, field, value } => {
            let (callback, rx) = channel();
            client.hset(key, field, value, callback)?;
            render(wait(rx, "hset").await?, |new| integer(u8::from(new)))
        }
        ConsoleCommand::HGetAll { key } => {
            let (callback, rx) = channel();
            client.hgetall(key, callback)?;
            render(wait(rx, "hgetall").await?, hash)
        }
        ConsoleCommand::HIncrBy { key, field, delta } => {
            let (callback, rx) = channel();
            client.hincrby(key, field, delta, callback)?;
            render(wait(rx, "hincrby").await?, integer)
        }
        ConsoleCommand::LPush { key, values } => {
            let (callback, rx) = channel();
            client.lpush(key, values, callback)?;
            render(wait(rx, "lpush").await?, integer)
        }
        ConsoleCommand::RPush { key, values } => {
            let (callback, rx) = channel();
            client.rpush(key, values, callback)?;
            render(wait(rx, "rpush").await?, integer)
        }
        ConsoleCommand::LPop { key } => {
            let (callback, rx) = channel();
            client.lpop(key, callback)?;
            render(wait(rx, "lpop").await?, string)
        }
        ConsoleCommand::RPop { key } => {
            let (callback, rx) = channel();
            client.rpop(key, callback)?;
            render(wait(rx, "rpop").await?, string)
        }
        ConsoleCommand::LRange { key, start, stop } => {
            let (callback, rx) = channel();
            client.lrange(key, start, stop, callback)?;
            render(wait(rx, "lrange").await?, list)
        }
        ConsoleCommand::ZAdd { key, score, member } => {
            let (callback, rx) = channel();
            client.zadd(key, vec![ScoredMember::new(member, score)], callback)?;
            render(wait(rx, "zadd").await?, integer)
        }
        ConsoleCommand::ZIncrBy { key, increment, member } => {
            let (callback, rx) = channel();
            client.zincrby(key, member, increment, callback)?;
            render(wait(rx, "zincrby").await?, string)
        }
        ConsoleCommand::ZRevRange { key, start, stop } => {
            let (callback, rx) = channel();
            client.zrevrange(key, start, stop, callback)?;
            render(wait(rx, "zrevrange").await?, scored)
        }
        ConsoleCommand::ZRevRank { key, member } => {
            let (callback, rx) = channel();
            client.zrevrank(key, member, callback)?;
            render(wait(rx, "zrevrank").await?, integer)
        }
        ConsoleCommand::SAdd { key, members } => {
            let (callback, rx) = channel();
            client.sadd(key, members, callback)?;
            render(wait(rx, "sadd").await?, integer)
        }
        ConsoleCommand::SMembers { key } => {
            let (callback, rx) = channel();
            client.smembers(key, callback)?;
            render(wait(rx, "smembers").await?, list)
        }
        ConsoleCommand::SIsMember { key, member } => {
            let (callback, rx) = channel();
            client.sismember(key, member, callback)?;
            render(wait(rx, "sismember").await?, |member| integer(u8::from(member)))
        }
        ConsoleCommand::Stats => {
            let stats = client.stats();
            format!(
                "queued: {}/{}\nworkers: {}\nexecuted: {}\nexecution panics: {}\nstopped: {}",
                stats.queued,
                stats.capacity,
                stats.workers,
                stats.executed,
                stats.execution_panics,
                stats.stopped
            )
        }
        ConsoleCommand::Help => HELP.to_string(),
        ConsoleCommand::Quit => String::new(),
    };
    Ok(output)
}

/// What the console does with one input line
#[derive(Debug, PartialEq)]
pub enum Response {
    Output(String),
    Quit,
}

/// Parse and run one line. Parse and submission errors are rendered as
/// output rather than returned.
pub async fn respond(client: &KvClient, line: &str) -> Response {
    let outcome = match parse_line(line) {
        Ok(ConsoleCommand::Quit) => return Response::Quit,
        Ok(command) => execute(client, command).await,
        Err(e) => Err(e),
    };
    match outcome {
        Ok(output) => Response::Output(output),
        Err(e) => Response::Output(format!("Error: {}", e)),
    }
}

pub const BANNER: &str = "dbqueue console. Type HELP for commands or QUIT to exit.";

/// Accept console connections until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    client: KvClient,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    info!(address = %listener.local_addr()?, "console listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let client = client.clone();
                    tokio::spawn(async move {
                        debug!(%peer, "console session opened");
                        if let Err(e) = session(stream, &client).await {
                            warn!(%peer, error = %e, "console session failed");
                        }
                        debug!(%peer, "console session closed");
                    });
                }
                Err(e) => warn!(error = %e, "failed to accept console connection"),
            },
            _ = shutdown.recv() => {
                info!("console shutting down");
                break;
            }
        }
    }
    Ok(())
}

async fn session(mut stream: TcpStream, client: &KvClient) -> Result<()> {
    let (reader, mut writer) = stream.split();
    let mut lines = BufReader::new(reader).lines();
    writer.write_all(format!("{}\r\n", BANNER).as_bytes()).await?;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match respond(client, &line).await {
            Response::Quit => {
                writer.write_all(b"Goodbye!\r\n").await?;
                break;
            }
            Response::Output(output) => {
                // Telnet clients expect CRLF line endings
                writer.write_all(output.replace('\n', "\r\n").as_bytes()).await?;
                writer.write_all(b"\r\n").await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientOptions;
    use crate::kv::MemoryKv;
    use std::sync::Arc;

    fn client() -> KvClient {
        let options = ClientOptions {
            name: "console-test".to_string(),
            worker_count: 2,
            queue_capacity: 16,
            ..ClientOptions::default()
        };
        KvClient::new(&options, Arc::new(MemoryKv::new()), None).unwrap()
    }

    #[test]
    fn test_parse_set_with_expiry() {
        assert_eq!(
            parse_line("set session \"a b c\" EX 30").unwrap(),
            ConsoleCommand::Set {
                key: "session".to_string(),
                value: "a b c".to_string(),
                ttl: Some(Duration::from_secs(30)),
            }
        );
    }

    #[test]
    fn test_parse_variadic_and_numeric_arguments() {
        assert_eq!(
            parse_line("  RPUSH queue a b c  ").unwrap(),
            ConsoleCommand::RPush {
                key: "queue".to_string(),
                values: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            }
        );
        assert_eq!(
            parse_line("lrange queue 0 -1").unwrap(),
            ConsoleCommand::LRange {
                key: "queue".to_string(),
                start: 0,
                stop: -1,
            }
        );
        assert_eq!(parse_line("quit").unwrap(), ConsoleCommand::Quit);
    }

    #[test]
    fn test_parse_errors() {
        for line in ["", "   ", "GET", "GET a b", "HINCRBY h f many", "FLUSHALL", "SET k \"open"] {
            assert!(
                matches!(parse_line(line), Err(DbQueueError::Console(_))),
                "line {:?} should not parse",
                line
            );
        }
        let err = parse_line("GET").unwrap_err();
        assert!(err.to_string().contains("wrong number of arguments"));
    }

    #[tokio::test]
    async fn test_execute_renders_replies() {
        let client = client();
        let run = |line: &str| {
            let command = parse_line(line).unwrap();
            let client = client.clone();
            async move { execute(&client, command).await.unwrap() }
        };

        assert_eq!(run("GET k1").await, "(nil)");
        assert_eq!(run("SET k1 v1").await, "OK");
        assert_eq!(run("GET k1").await, "\"v1\"");
        assert_eq!(run("RPUSH l a b").await, "(integer) 2");
        assert_eq!(run("LRANGE l 0 -1").await, "1) \"a\"\n2) \"b\"");
        assert_eq!(run("SMEMBERS nothing").await, "(empty list)");
        assert!(run("HGET l f").await.starts_with("(error) wrong type"));
        assert!(run("STATS").await.contains("workers: 2"));
        assert!(run("SET k2 v EX 18446744073709551615")
            .await
            .starts_with("(error) invalid argument"));
    }

    #[tokio::test]
    async fn test_respond() {
        let client = client();
        assert_eq!(respond(&client, "quit").await, Response::Quit);
        assert_eq!(respond(&client, "HELP").await, Response::Output(HELP.to_string()));
        assert_eq!(
            respond(&client, "FLUSHALL").await,
            Response::Output("Error: Console command error: unknown command FLUSHALL".to_string())
        );
    }

    #[tokio::test]
    async fn test_serve_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let server = tokio::spawn(serve(listener, client(), shutdown_rx));

        let mut stream = TcpStream::connect(address).await.unwrap();
        let (reader, mut writer) = stream.split();
        let mut lines = BufReader::new(reader).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), BANNER);

        writer.write_all(b"SET greeting \"hello world\"\r\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "OK");

        writer.write_all(b"GET greeting\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "\"hello world\"");

        writer.write_all(b"RPUSH l a b\nLRANGE l 0 -1\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "(integer) 2");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "1) \"a\"");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "2) \"b\"");

        writer.write_all(b"QUIT\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "Goodbye!");
        assert_eq!(lines.next_line().await.unwrap(), None);

        shutdown_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
