// mock_redis: A minimal RESP2 server backing queue-drain tests.
//
// Implements just the command surface the shipper touches: SELECT, MULTI /
// EXEC transactions around LRANGE + LTRIM, plus RPUSH / LLEN / DEL / PING
// for test setup and assertions.  List state is shared across connections,
// like a single real server instance.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// A mock queue server for integration testing.
///
/// Binds to port 0 (random); each test spins up its own instance and
/// seeds lists through [`MockRedis::push`].
pub struct MockRedis {
    addr: SocketAddr,
    state: Arc<RedisState>,
    /// Handle to the background accept loop; dropped with the server.
    _task: tokio::task::JoinHandle<()>,
}

struct RedisState {
    lists: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
}

impl MockRedis {
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(RedisState {
            lists: Mutex::new(HashMap::new()),
        });

        let accept_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let conn_state = Arc::clone(&accept_state);
                        tokio::spawn(async move {
                            let _ = handle_connection(stream, conn_state).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(MockRedis {
            addr,
            state,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Append a payload to the tail of `list` (what collectors do with RPUSH).
    pub fn push(&self, list: &str, payload: &[u8]) {
        self.state
            .lists
            .lock()
            .expect("lists lock")
            .entry(list.to_owned())
            .or_default()
            .push_back(payload.to_vec());
    }

    /// Current length of `list`.
    pub fn len(&self, list: &str) -> usize {
        self.state
            .lists
            .lock()
            .expect("lists lock")
            .get(list)
            .map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, list: &str) -> bool {
        self.len(list) == 0
    }
}

// ---------------------------------------------------------------------------
// Connection handling
// ---------------------------------------------------------------------------

enum Reply {
    Simple(&'static str),
    Error(String),
    Int(i64),
    Bulk(Vec<u8>),
    Array(Vec<Reply>),
}

async fn handle_connection(
    stream: TcpStream,
    state: Arc<RedisState>,
) -> Result<(), std::io::Error> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    // Commands queued between MULTI and EXEC.
    let mut queued: Option<Vec<Vec<Vec<u8>>>> = None;

    while let Some(args) = read_command(&mut reader).await? {
        if args.is_empty() {
            continue;
        }
        let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();

        let reply = match name.as_str() {
            "MULTI" => {
                queued = Some(Vec::new());
                Reply::Simple("OK")
            }
            "EXEC" => match queued.take() {
                // The lock is held across the whole transaction, so a
                // concurrent drainer can never claim the same records.
                Some(commands) => {
                    let mut lists = state.lists.lock().expect("lists lock");
                    Reply::Array(
                        commands
                            .into_iter()
                            .map(|cmd| execute_with(&mut lists, &cmd))
                            .collect(),
                    )
                }
                None => Reply::Error("ERR EXEC without MULTI".to_owned()),
            },
            "DISCARD" => {
                queued = None;
                Reply::Simple("OK")
            }
            _ => match &mut queued {
                Some(commands) => {
                    commands.push(args);
                    Reply::Simple("QUEUED")
                }
                None => execute(&state, &args),
            },
        };

        let mut out = Vec::new();
        write_reply(&mut out, &reply);
        write_half.write_all(&out).await?;
    }

    Ok(())
}

fn execute(state: &RedisState, args: &[Vec<u8>]) -> Reply {
    let mut lists = state.lists.lock().expect("lists lock");
    execute_with(&mut lists, args)
}

fn execute_with(lists: &mut HashMap<String, VecDeque<Vec<u8>>>, args: &[Vec<u8>]) -> Reply {
    let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();

    match name.as_str() {
        "PING" => Reply::Simple("PONG"),
        "SELECT" | "CLIENT" => Reply::Simple("OK"),
        "RPUSH" if args.len() >= 3 => {
            let list = lists
                .entry(String::from_utf8_lossy(&args[1]).into_owned())
                .or_default();
            for payload in &args[2..] {
                list.push_back(payload.clone());
            }
            Reply::Int(list.len() as i64)
        }
        "LLEN" if args.len() == 2 => {
            let key = String::from_utf8_lossy(&args[1]);
            Reply::Int(lists.get(key.as_ref()).map_or(0, VecDeque::len) as i64)
        }
        "DEL" => {
            let mut removed = 0;
            for key in &args[1..] {
                if lists.remove(String::from_utf8_lossy(key).as_ref()).is_some() {
                    removed += 1;
                }
            }
            Reply::Int(removed)
        }
        "LRANGE" if args.len() == 4 => {
            let key = String::from_utf8_lossy(&args[1]).into_owned();
            let list = lists.entry(key).or_default();
            match (parse_index(&args[2]), parse_index(&args[3])) {
                (Some(start), Some(stop)) => {
                    let (start, stop) = normalize_range(start, stop, list.len());
                    Reply::Array(
                        (start..stop)
                            .filter_map(|i| list.get(i))
                            .map(|payload| Reply::Bulk(payload.clone()))
                            .collect(),
                    )
                }
                _ => Reply::Error("ERR value is not an integer".to_owned()),
            }
        }
        "LTRIM" if args.len() == 4 => {
            let key = String::from_utf8_lossy(&args[1]).into_owned();
            let list = lists.entry(key).or_default();
            match (parse_index(&args[2]), parse_index(&args[3])) {
                (Some(start), Some(stop)) => {
                    let (start, stop) = normalize_range(start, stop, list.len());
                    let kept: VecDeque<Vec<u8>> =
                        (start..stop).filter_map(|i| list.get(i).cloned()).collect();
                    *list = kept;
                    Reply::Simple("OK")
                }
                _ => Reply::Error("ERR value is not an integer".to_owned()),
            }
        }
        other => Reply::Error(format!("ERR unknown command '{other}'")),
    }
}

fn parse_index(raw: &[u8]) -> Option<i64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

/// Resolve a redis start/stop pair (inclusive, negatives from the tail)
/// into an exclusive-end `start..stop` over a list of `len` elements.
fn normalize_range(start: i64, stop: i64, len: usize) -> (usize, usize) {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start.min(len) };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if stop < start {
        (0, 0)
    } else {
        (start as usize, (stop + 1) as usize)
    }
}

// ---------------------------------------------------------------------------
// RESP framing
// ---------------------------------------------------------------------------

/// Read one RESP array-of-bulk-strings command; `None` on clean EOF.
async fn read_command<R: AsyncBufReadExt + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<Vec<u8>>>, std::io::Error> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let line = line.trim_end();
    let count: usize = match line.strip_prefix('*').and_then(|n| n.parse().ok()) {
        Some(n) => n,
        None => return Ok(Some(Vec::new())), // tolerate stray lines
    };

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let mut header = String::new();
        if reader.read_line(&mut header).await? == 0 {
            return Ok(None);
        }
        let len: usize = header
            .trim_end()
            .strip_prefix('$')
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "expected bulk string")
            })?;
        let mut payload = vec![0u8; len + 2]; // payload + CRLF
        reader.read_exact(&mut payload).await?;
        payload.truncate(len);
        args.push(payload);
    }
    Ok(Some(args))
}

fn write_reply(out: &mut Vec<u8>, reply: &Reply) {
    match reply {
        Reply::Simple(s) => {
            out.extend_from_slice(format!("+{s}\r\n").as_bytes());
        }
        Reply::Error(e) => {
            out.extend_from_slice(format!("-{e}\r\n").as_bytes());
        }
        Reply::Int(n) => {
            out.extend_from_slice(format!(":{n}\r\n").as_bytes());
        }
        Reply::Bulk(payload) => {
            out.extend_from_slice(format!("${}\r\n", payload.len()).as_bytes());
            out.extend_from_slice(payload);
            out.extend_from_slice(b"\r\n");
        }
        Reply::Array(items) => {
            out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
            for item in items {
                write_reply(out, item);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_range_handles_negatives_and_bounds() {
        // LRANGE 0 1 over 5 elements -> first two
        assert_eq!(normalize_range(0, 1, 5), (0, 2));
        // LTRIM 2 -1 over 5 elements -> keep the tail from index 2
        assert_eq!(normalize_range(2, -1, 5), (2, 5));
        // Range past the end clamps
        assert_eq!(normalize_range(0, 99, 3), (0, 3));
        // Inverted range is empty
        assert_eq!(normalize_range(4, 1, 5), (0, 0));
        // Empty list
        assert_eq!(normalize_range(0, -1, 0), (0, 0));
    }
}
