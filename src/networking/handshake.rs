/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Mutual authentication of a fresh connection.
//!
//! 1. The server sends a 40-byte nonce: the chain ID, 31 random bytes, and its clock as
//!    nanoseconds since the Unix Epoch.
//! 2. The client checks the chain ID and the clock skew, and answers with its signature over the hash of
//!    the server's nonce, a nonce of its own, and optionally the address it acts for.
//! 3. The server recovers the client's public hash, decides whether to accept it, checks the client's
//!    nonce, and answers with its signature over the hash of the client's nonce.
//! 4. The client recovers the server's public hash.
//!
//! Either side refuses a peer that turns out to be itself.

use std::fmt::{self, Display, Formatter};
use std::io::{self, Read, Write};
use std::time::Duration;

use borsh::{BorshDeserialize, BorshSerialize};
use rand::Rng;

use crate::types::basic::{timestamp_now, Address, ChainID, PublicHash, Timestamp};
use crate::types::crypto_primitives::{hash_bytes, Keypair, RecoverableSignature};

use super::network::PeerID;

pub const NONCE_LENGTH: usize = 40;

/// Handshake messages are small. Anything longer than this is not a handshake.
const MAX_HELLO_LENGTH: u32 = 1024;

pub type Nonce = [u8; NONCE_LENGTH];

#[derive(BorshSerialize, BorshDeserialize)]
struct ClientHello {
    signature: RecoverableSignature,
    nonce: Nonce,
    address: Option<Address>,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct ServerHello {
    signature: RecoverableSignature,
}

#[derive(Debug)]
pub enum HandshakeError {
    Io(io::Error),
    InvalidHandshake(String),
    InvalidChainID { expected: ChainID, got: u8 },
    InvalidTimestamp { skew: Duration },
    /// The peer authenticated, but is not allowed on this mesh.
    InvalidPeerKey(PublicHash),
    /// The peer is this node.
    SelfConnection,
}

impl From<io::Error> for HandshakeError {
    fn from(error: io::Error) -> Self {
        HandshakeError::Io(error)
    }
}

impl Display for HandshakeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::Io(error) => write!(f, "io: {}", error),
            HandshakeError::InvalidHandshake(reason) => write!(f, "invalid handshake: {}", reason),
            HandshakeError::InvalidChainID { expected, got } => {
                write!(f, "expected chain {}, got {}", expected.int(), got)
            }
            HandshakeError::InvalidTimestamp { skew } => {
                write!(f, "clock skew of {}ms", skew.as_millis())
            }
            HandshakeError::InvalidPeerKey(public_hash) => {
                write!(f, "peer {} is not allowed", public_hash)
            }
            HandshakeError::SelfConnection => write!(f, "connected to self"),
        }
    }
}

/// A fresh nonce stamped with `chain_id` and `now`.
pub fn new_nonce(chain_id: ChainID, now: Timestamp) -> Nonce {
    let mut nonce = [0u8; NONCE_LENGTH];
    nonce[0] = chain_id.int();
    rand::thread_rng().fill(&mut nonce[1..32]);
    nonce[32..40].copy_from_slice(&now.to_le_bytes());
    nonce
}

/// Check that `nonce` belongs to `chain_id` and was stamped within `max_skew` of `now`.
pub fn check_nonce(
    nonce: &Nonce,
    chain_id: ChainID,
    now: Timestamp,
    max_skew: Duration,
) -> Result<(), HandshakeError> {
    if nonce[0] != chain_id.int() {
        return Err(HandshakeError::InvalidChainID {
            expected: chain_id,
            got: nonce[0],
        });
    }

    let mut stamp = [0u8; 8];
    stamp.copy_from_slice(&nonce[32..40]);
    let stamped = Timestamp::from_le_bytes(stamp);
    let skew = Duration::from_nanos(stamped.abs_diff(now));
    if skew > max_skew {
        return Err(HandshakeError::InvalidTimestamp { skew });
    }
    Ok(())
}

/// Run the server side of the handshake. `authorize` maps the client's public hash and claimed address
/// to its identity on this mesh, or refuses it.
pub fn accept<S, F>(
    stream: &mut S,
    keypair: &Keypair,
    chain_id: ChainID,
    max_skew: Duration,
    authorize: F,
) -> Result<PeerID, HandshakeError>
where
    S: Read + Write,
    F: FnOnce(&PublicHash, Option<&Address>) -> Option<PeerID>,
{
    let server_nonce = new_nonce(chain_id, timestamp_now());
    stream.write_all(&server_nonce)?;
    stream.flush()?;

    let client_hello: ClientHello = read_hello(stream)?;
    let client = client_hello
        .signature
        .recover(&hash_bytes(&server_nonce))
        .map_err(|error| HandshakeError::InvalidHandshake(error.to_string()))?;
    if client == keypair.public_hash() {
        return Err(HandshakeError::SelfConnection);
    }
    check_nonce(&client_hello.nonce, chain_id, timestamp_now(), max_skew)?;
    let peer = authorize(&client, client_hello.address.as_ref())
        .ok_or(HandshakeError::InvalidPeerKey(client))?;

    write_hello(
        stream,
        &ServerHello {
            signature: keypair.sign(&hash_bytes(&client_hello.nonce)),
        },
    )?;
    Ok(peer)
}

/// Run the client side of the handshake. Returns the public hash of the server.
pub fn connect<S: Read + Write>(
    stream: &mut S,
    keypair: &Keypair,
    chain_id: ChainID,
    max_skew: Duration,
    address: Option<Address>,
) -> Result<PublicHash, HandshakeError> {
    let mut server_nonce = [0u8; NONCE_LENGTH];
    stream.read_exact(&mut server_nonce)?;
    check_nonce(&server_nonce, chain_id, timestamp_now(), max_skew)?;

    let client_nonce = new_nonce(chain_id, timestamp_now());
    write_hello(
        stream,
        &ClientHello {
            signature: keypair.sign(&hash_bytes(&server_nonce)),
            nonce: client_nonce,
            address,
        },
    )?;

    let server_hello: ServerHello = read_hello(stream)?;
    let server = server_hello
        .signature
        .recover(&hash_bytes(&client_nonce))
        .map_err(|error| HandshakeError::InvalidHandshake(error.to_string()))?;
    if server == keypair.public_hash() {
        return Err(HandshakeError::SelfConnection);
    }
    Ok(server)
}

fn write_hello<S: Write, T: BorshSerialize>(stream: &mut S, hello: &T) -> Result<(), HandshakeError> {
    let bytes = hello.try_to_vec()?;
    stream.write_all(&(bytes.len() as u32).to_le_bytes())?;
    stream.write_all(&bytes)?;
    stream.flush()?;
    Ok(())
}

fn read_hello<S: Read, T: BorshDeserialize>(stream: &mut S) -> Result<T, HandshakeError> {
    let mut length = [0u8; 4];
    stream.read_exact(&mut length)?;
    let length = u32::from_le_bytes(length);
    if length > MAX_HELLO_LENGTH {
        return Err(HandshakeError::InvalidHandshake(format!(
            "hello of {} bytes",
            length
        )));
    }
    let mut bytes = vec![0u8; length as usize];
    stream.read_exact(&mut bytes)?;
    T::try_from_slice(&bytes).map_err(|error| HandshakeError::InvalidHandshake(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    use crate::types::crypto_primitives::SigningKey;

    const SKEW: Duration = Duration::from_secs(30);

    fn keypair(byte: u8) -> Keypair {
        Keypair::new(SigningKey::from_bytes(&[byte; 32]))
    }

    #[test]
    fn nonce_checks() {
        let now = 1_000_000_000_000;
        let nonce = new_nonce(ChainID::new(7), now);
        check_nonce(&nonce, ChainID::new(7), now + 29_000_000_000, SKEW).unwrap();
        assert!(matches!(
            check_nonce(&nonce, ChainID::new(7), now + 31_000_000_000, SKEW),
            Err(HandshakeError::InvalidTimestamp { .. })
        ));
        assert!(matches!(
            check_nonce(&nonce, ChainID::new(8), now, SKEW),
            Err(HandshakeError::InvalidChainID { got: 7, .. })
        ));
    }

    fn run(
        server_key: Keypair,
        client_key: Keypair,
        address: Option<Address>,
        allowed: PublicHash,
    ) -> (
        Result<PeerID, HandshakeError>,
        Result<PublicHash, HandshakeError>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let server_address = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            accept(
                &mut stream,
                &server_key,
                ChainID::new(1),
                SKEW,
                |public_hash, address| match address {
                    Some(address) if *public_hash == allowed => Some(PeerID::Formulator(*address)),
                    None if *public_hash == allowed => Some(PeerID::Observer(*public_hash)),
                    _ => None,
                },
            )
        });

        let mut stream = TcpStream::connect(server_address).unwrap();
        let client = connect(&mut stream, &client_key, ChainID::new(1), SKEW, address);
        drop(stream);
        (server.join().unwrap(), client)
    }

    #[test]
    fn both_sides_learn_each_other() {
        let (server, client) = run(keypair(1), keypair(2), None, keypair(2).public_hash());
        assert_eq!(server.unwrap(), PeerID::Observer(keypair(2).public_hash()));
        assert_eq!(client.unwrap(), keypair(1).public_hash());
    }

    #[test]
    fn formulators_present_their_address() {
        let address = Address::new([5; 20]);
        let (server, _) = run(keypair(1), keypair(2), Some(address), keypair(2).public_hash());
        assert_eq!(server.unwrap(), PeerID::Formulator(address));
    }

    #[test]
    fn unknown_peers_and_self_are_refused() {
        let (server, client) = run(keypair(1), keypair(3), None, keypair(2).public_hash());
        assert!(matches!(server, Err(HandshakeError::InvalidPeerKey(_))));
        assert!(client.is_err());

        let (server, _) = run(keypair(1), keypair(1), None, keypair(1).public_hash());
        assert!(matches!(server, Err(HandshakeError::SelfConnection)));
    }
}
