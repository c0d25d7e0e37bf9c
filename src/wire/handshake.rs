//! Connection handshake.
//!
//! The initiator sends `Hello{tag, role:"client"}`; the acceptor answers
//! `HelloAck{tag, role}`. A `"server"` role hands the connection to the
//! caller. A `"daemon"` role is followed by a `Redirect{address}` and the
//! initiator starts over against that address, up to a bounded number of
//! hops.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::Connection;
use crate::addr::Address;
use crate::error::{Result, SiphonError};

pub const PROTOCOL_TAG: &str = "siphon";
pub const ROLE_CLIENT: &str = "client";
pub const ROLE_SERVER: &str = "server";
pub const ROLE_DAEMON: &str = "daemon";

/// Both `Hello` and `HelloAck` share this shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub tag: String,
    pub role: String,
}

impl Hello {
    pub fn new(role: &str) -> Self {
        Self {
            tag: PROTOCOL_TAG.to_string(),
            role: role.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    pub address: Address,
}

fn expect<T: DeserializeOwned>(conn: &Connection) -> Result<T> {
    conn.decode::<T>()
        .map_err(SiphonError::HandshakeIo)?
        .ok_or(SiphonError::HandshakeClosed)
}

fn send<T: Serialize>(conn: &Connection, record: &T) -> Result<()> {
    conn.encode(record).map_err(SiphonError::HandshakeIo)
}

/// Run the initiating side, following redirects through `dial`.
///
/// Returns the connection the handshake completed on, which differs from
/// `conn` when the peer redirected. Abandoned connections are dropped, which
/// closes them.
pub fn initiate<D>(mut conn: Connection, max_redirects: usize, mut dial: D) -> Result<Connection>
where
    D: FnMut(&Address) -> Result<Connection>,
{
    let mut hops = 0;
    loop {
        send(&conn, &Hello::new(ROLE_CLIENT))?;
        let ack: Hello = expect(&conn)?;
        if ack.tag != PROTOCOL_TAG {
            let _ = conn.close();
            return Err(SiphonError::ProtocolMismatch(ack.tag));
        }

        match ack.role.as_str() {
            ROLE_SERVER => return Ok(conn),
            ROLE_DAEMON => {
                let redirect: Redirect = expect(&conn)?;
                if hops >= max_redirects {
                    let _ = conn.close();
                    return Err(SiphonError::RedirectLimit(max_redirects));
                }
                hops += 1;
                conn = dial(&redirect.address)?;
            }
            other => {
                let _ = conn.close();
                return Err(SiphonError::UnexpectedRole(other.to_string()));
            }
        }
    }
}

/// Read and validate the initiator's `Hello`.
pub fn await_hello(conn: &Connection) -> Result<()> {
    let hello: Hello = expect(conn)?;
    if hello.tag != PROTOCOL_TAG {
        return Err(SiphonError::ProtocolMismatch(hello.tag));
    }
    if hello.role != ROLE_CLIENT {
        return Err(SiphonError::UnexpectedRole(hello.role));
    }
    Ok(())
}

/// Accept as the session host.
pub fn accept(conn: &Connection) -> Result<()> {
    send(conn, &Hello::new(ROLE_SERVER))
}

/// Answer as a router, sending the initiator on to `target`.
pub fn refer(conn: &Connection, target: &Address) -> Result<()> {
    await_hello(conn)?;
    send(conn, &Hello::new(ROLE_DAEMON))?;
    send(
        conn,
        &Redirect {
            address: target.clone(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Message;
    use std::os::unix::net::UnixStream;
    use std::thread;

    fn pair() -> (Connection, Connection) {
        let (a, b) = UnixStream::pair().unwrap();
        (
            Connection::from_unix(a).unwrap(),
            Connection::from_unix(b).unwrap(),
        )
    }

    fn no_dial(_: &Address) -> Result<Connection> {
        panic!("unexpected redirect");
    }

    #[test]
    fn test_server_role_binds_same_connection() {
        let (client, server) = pair();
        let peer = thread::spawn(move || {
            await_hello(&server).unwrap();
            accept(&server).unwrap();
            let m: Message = server.decode().unwrap().unwrap();
            m.content.unwrap()
        });

        let label = client.label().to_string();
        let conn = initiate(client, 4, no_dial).unwrap();
        assert_eq!(conn.label(), label);
        conn.encode(&Message::content(b"after")).unwrap();
        assert_eq!(peer.join().unwrap(), b"after");
    }

    #[test]
    fn test_tag_mismatch_closes_connection() {
        let (client, server) = pair();
        let peer = thread::spawn(move || {
            let _: Hello = server.decode().unwrap().unwrap();
            server
                .encode(&Hello {
                    tag: "other".to_string(),
                    role: ROLE_SERVER.to_string(),
                })
                .unwrap();
            // The initiator must hang up.
            server.decode::<Message>().unwrap().is_none()
        });

        match initiate(client, 4, no_dial) {
            Err(SiphonError::ProtocolMismatch(tag)) => assert_eq!(tag, "other"),
            other => panic!("expected ProtocolMismatch, got {:?}", other),
        }
        assert!(peer.join().unwrap());
    }

    #[test]
    fn test_unknown_role_rejected() {
        let (client, server) = pair();
        let peer = thread::spawn(move || {
            await_hello(&server).unwrap();
            server.encode(&Hello::new("janitor")).unwrap();
        });

        match initiate(client, 4, no_dial) {
            Err(SiphonError::UnexpectedRole(role)) => assert_eq!(role, "janitor"),
            other => panic!("expected UnexpectedRole, got {:?}", other),
        }
        peer.join().unwrap();
    }

    #[test]
    fn test_redirect_dials_target_and_abandons_daemon() {
        let (client, daemon) = pair();
        let target = Address::new("real", "unix", "/nonexistent/real.sock").unwrap();
        let target_for_daemon = target.clone();

        let daemon_side = thread::spawn(move || {
            refer(&daemon, &target_for_daemon).unwrap();
            // Nothing further arrives on the daemon connection.
            daemon.decode::<Message>().unwrap().is_none()
        });

        let (redirected, host) = pair();
        let host_side = thread::spawn(move || {
            await_hello(&host).unwrap();
            accept(&host).unwrap();
            let m: Message = host.decode().unwrap().unwrap();
            m.content.unwrap()
        });

        let redirected_label = redirected.label().to_string();
        let mut slot = Some(redirected);
        let conn = initiate(client, 4, |addr| {
            assert_eq!(addr, &target);
            Ok(slot.take().expect("dialed twice"))
        })
        .unwrap();

        assert_eq!(conn.label(), redirected_label);
        conn.encode(&Message::content(b"to host")).unwrap();
        assert_eq!(host_side.join().unwrap(), b"to host");
        assert!(daemon_side.join().unwrap());
    }

    #[test]
    fn test_redirect_depth_is_bounded() {
        let target = Address::new("loop", "unix", "/nonexistent/loop.sock").unwrap();
        let (client, daemon) = pair();
        let t = target.clone();
        let mut peers = vec![thread::spawn(move || {
            let _ = refer(&daemon, &t);
        })];

        let mut dials = 0;
        let result = initiate(client, 3, |_| {
            dials += 1;
            let (near, far) = pair();
            let t = target.clone();
            peers.push(thread::spawn(move || {
                let _ = refer(&far, &t);
            }));
            Ok(near)
        });

        match result {
            Err(SiphonError::RedirectLimit(n)) => assert_eq!(n, 3),
            other => panic!("expected RedirectLimit, got {:?}", other),
        }
        assert_eq!(dials, 3);
        for p in peers {
            p.join().unwrap();
        }
    }

    #[test]
    fn test_peer_hangup_during_handshake() {
        let (client, server) = pair();
        drop(server);
        assert!(matches!(
            initiate(client, 4, no_dial),
            Err(SiphonError::HandshakeClosed) | Err(SiphonError::HandshakeIo(_))
        ));
    }

    #[test]
    fn test_responder_rejects_foreign_hello() {
        let (client, server) = pair();
        client
            .encode(&Hello {
                tag: "ssh".to_string(),
                role: ROLE_CLIENT.to_string(),
            })
            .unwrap();
        assert!(matches!(
            await_hello(&server),
            Err(SiphonError::ProtocolMismatch(_))
        ));
    }
}
