//! Line-oriented protocol bundled with the front-end.
//!
//! Every request is one line of space-separated words; every reply is one
//! line starting with `OK` or `ERR`.
//!
//! | Request                            | Reply                          |
//! |------------------------------------|--------------------------------|
//! | `PING`                             | `OK PONG`                      |
//! | `CAPS`                             | `OK <mechanism>,...`           |
//! | `STARTTLS`                         | `OK STARTTLS`, then handshake  |
//! | `AUTH <mechanism> <user> [<pass>]` | `OK <connection id>`           |
//! | `KILL <connection id>`             | `OK`                           |
//! | `DOCID [<offset> <increment>]`     | `OK <document id>`             |
//! | `PREPARE <client stmt id>`         | `OK <statement id>`            |
//! | `STMTID <client stmt id>`          | `OK <statement id>`            |
//! | `DEALLOCATE <client stmt id>`      | `OK <statement id>`            |
//! | `DOCIDS ON\|OFF`                   | `OK`                           |
//! | `DOCIDS TAKE`                      | `OK <document id> ...`         |
//! | `QUIT`                             | `OK BYE`                       |

use crate::kill::KillError;
use crate::network::{Client, ClientError, ConnectionId};
use crate::protocol::ProtocolHandler;
use std::io;
use tracing::{debug, trace};

/// Handler for the bundled line protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextProtocol;

enum Flow {
    Continue,
    Quit,
}

impl TextProtocol {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn dispatch(client: &mut Client, line: &str) -> io::Result<Flow> {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            return Ok(Flow::Continue);
        };
        let args: Vec<&str> = words.collect();
        trace!(connection_id = %client.id(), command, "Request");

        let reply = match command.to_ascii_uppercase().as_str() {
            "PING" => Ok("PONG".to_string()),
            "CAPS" => Ok(client_mechanisms(client)),
            "STARTTLS" => return start_tls(client),
            "AUTH" => auth(client, &args),
            "KILL" => kill(client, &args),
            "DOCID" => document_id(client, &args),
            "PREPARE" => prepare(client, &args),
            "STMTID" => statement_id(client, &args),
            "DEALLOCATE" => deallocate(client, &args),
            "DOCIDS" => document_ids(client, &args),
            "QUIT" => {
                client.write_line("OK BYE")?;
                return Ok(Flow::Quit);
            },
            other => Err(format!("unknown command '{other}'")),
        };

        match reply {
            Ok(body) if body.is_empty() => client.write_line("OK")?,
            Ok(body) => client.write_line(&format!("OK {body}"))?,
            Err(message) => client.write_line(&format!("ERR {message}"))?,
        }
        Ok(Flow::Continue)
    }
}

impl ProtocolHandler for TextProtocol {
    fn name(&self) -> &str {
        "text"
    }

    fn serve(&self, client: &mut Client) -> io::Result<()> {
        while let Some(line) = client.read_line()? {
            if let Flow::Quit = Self::dispatch(client, &line)? {
                debug!(connection_id = %client.id(), "Client quit");
                break;
            }
        }
        Ok(())
    }
}

type Reply = Result<String, String>;

fn client_mechanisms(client: &Client) -> String {
    client.mechanisms().join(",")
}

fn start_tls(client: &mut Client) -> io::Result<Flow> {
    if !client.tls_available() {
        client.write_line("ERR TLS is not available")?;
        return Ok(Flow::Continue);
    }
    client.write_line("OK STARTTLS")?;
    match client.start_tls() {
        Ok(()) => Ok(Flow::Continue),
        Err(ClientError::Io(e)) => Err(e),
        Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
    }
}

fn auth(client: &mut Client, args: &[&str]) -> Reply {
    let (mechanism, user, credential) = match args {
        [mechanism, user] => (*mechanism, *user, ""),
        [mechanism, user, credential] => (*mechanism, *user, *credential),
        _ => return Err("usage: AUTH <mechanism> <user> [<password>]".into()),
    };
    client
        .authenticate(mechanism, user, credential)
        .map(|id| id.to_string())
        .map_err(|e| e.to_string())
}

fn kill(client: &mut Client, args: &[&str]) -> Reply {
    let [target] = args else {
        return Err("usage: KILL <connection id>".into());
    };
    let target = target.parse::<u64>().map_err(|_| format!("invalid connection id '{target}'"))?;
    match client.kill(ConnectionId::new(target)) {
        Ok(()) => Ok(String::new()),
        Err(ClientError::Kill(KillError::NoSuchConnection(id))) => {
            Err(format!("no such connection {id}"))
        },
        Err(e) => Err(e.to_string()),
    }
}

fn document_id(client: &Client, args: &[&str]) -> Reply {
    let (offset, increment) = match args {
        [] => (1, 1),
        [offset, increment] => (parse_number(offset)?, parse_number(increment)?),
        _ => return Err("usage: DOCID [<offset> <increment>]".into()),
    };
    Ok(client.document_id(offset, increment))
}

fn prepare(client: &Client, args: &[&str]) -> Reply {
    let [id] = args else {
        return Err("usage: PREPARE <client statement id>".into());
    };
    client.prepare(parse_number(id)?).map(|id| id.to_string()).map_err(|e| e.to_string())
}

fn statement_id(client: &Client, args: &[&str]) -> Reply {
    let [id] = args else {
        return Err("usage: STMTID <client statement id>".into());
    };
    let client_id = parse_number(id)?;
    client
        .statement_id(client_id)
        .map(|id| id.to_string())
        .ok_or_else(|| format!("unknown statement {client_id}"))
}

fn deallocate(client: &Client, args: &[&str]) -> Reply {
    let [id] = args else {
        return Err("usage: DEALLOCATE <client statement id>".into());
    };
    let client_id = parse_number(id)?;
    match client.deallocate(client_id) {
        Ok(Some(id)) => Ok(id.to_string()),
        Ok(None) => Err(format!("unknown statement {client_id}")),
        Err(e) => Err(e.to_string()),
    }
}

fn document_ids(client: &Client, args: &[&str]) -> Reply {
    let result = match args {
        [mode] if mode.eq_ignore_ascii_case("ON") => {
            client.set_id_retention(true).map(|()| String::new())
        },
        [mode] if mode.eq_ignore_ascii_case("OFF") => {
            client.set_id_retention(false).map(|()| String::new())
        },
        [mode] if mode.eq_ignore_ascii_case("TAKE") => {
            client.take_document_ids().map(|ids| ids.join(" "))
        },
        _ => return Err("usage: DOCIDS ON|OFF|TAKE".into()),
    };
    result.map_err(|e| e.to_string())
}

fn parse_number<T: std::str::FromStr>(value: &str) -> Result<T, String> {
    value.parse().map_err(|_| format!("invalid number '{value}'"))
}
