//! Noise IK secure channel for the control protocol.
//!
//! The client sends its initiation inside the HTTP upgrade request; the
//! server answers with a response message on the hijacked connection and
//! both sides switch to encrypted records.
//!
//! Wire format:
//! - initiation: `[2-byte BE protocol version][type=1][2-byte BE length][96-byte Noise message]`
//! - response:   `[type=2][2-byte BE length][48-byte Noise message]`
//! - error:      `[type=3][2-byte BE length][UTF-8 reason]`
//! - record:     `[type=4][2-byte BE length][ciphertext]`
//!
//! No message, headers included, exceeds [`MAX_MESSAGE_SIZE`].

use crate::error::{ControlError, ControlResult};
use crate::key::{MachinePrivate, MachinePublic};
use snow::{params::NoiseParams, Builder, HandshakeState, StatelessTransportState};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

const NOISE_PATTERN: &str = "Noise_IK_25519_ChaChaPoly_BLAKE2s";

/// Largest message on the wire, header included.
pub const MAX_MESSAGE_SIZE: usize = 4096;

const HEADER_LEN: usize = 3;
const VERSION_LEN: usize = 2;
const TAG_LEN: usize = 16;

/// Largest ciphertext carried by one record.
pub const MAX_CIPHERTEXT_SIZE: usize = MAX_MESSAGE_SIZE - HEADER_LEN;

/// Largest plaintext carried by one record.
pub const MAX_PLAINTEXT_SIZE: usize = MAX_CIPHERTEXT_SIZE - TAG_LEN;

/// `e, es, s, ss` with an empty payload.
const INITIATION_NOISE_LEN: usize = 96;
/// `e, ee, se` with an empty payload.
const RESPONSE_NOISE_LEN: usize = 48;

/// Total size of an initiation message.
pub const INITIATION_LEN: usize = VERSION_LEN + HEADER_LEN + INITIATION_NOISE_LEN;

/// Message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Initiation = 1,
    Response = 2,
    Error = 3,
    Record = 4,
}

impl From<MessageType> for u8 {
    fn from(m: MessageType) -> u8 {
        m as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ControlError;

    fn try_from(v: u8) -> ControlResult<Self> {
        match v {
            1 => Ok(Self::Initiation),
            2 => Ok(Self::Response),
            3 => Ok(Self::Error),
            4 => Ok(Self::Record),
            other => Err(ControlError::InvalidMessage(format!("unknown message type {other}"))),
        }
    }
}

fn noise_params() -> ControlResult<NoiseParams> {
    Ok(NOISE_PATTERN.parse()?)
}

fn prologue(version: u16) -> String {
    format!("Tailscale Control Protocol v{version}")
}

fn header(msg_type: MessageType, len: usize) -> [u8; HEADER_LEN] {
    let l = (len as u16).to_be_bytes();
    [msg_type.into(), l[0], l[1]]
}

/// Server side of a handshake whose initiation has been validated.
///
/// Everything that can fail on bad client input happens in [`accept`],
/// before the caller commits to the protocol switch.
///
/// [`accept`]: ServerHandshake::accept
pub struct ServerHandshake {
    peer: MachinePublic,
    protocol_version: u16,
    response: Vec<u8>,
    transport: StatelessTransportState,
}

impl ServerHandshake {
    /// Consume the client's initiation message and prepare the response.
    pub fn accept(server_key: &MachinePrivate, initiation: &[u8]) -> ControlResult<Self> {
        if initiation.len() != INITIATION_LEN {
            return Err(ControlError::Handshake(format!(
                "initiation has wrong size: {} bytes (expected {INITIATION_LEN})",
                initiation.len()
            )));
        }

        let protocol_version = u16::from_be_bytes([initiation[0], initiation[1]]);
        let msg_type = MessageType::try_from(initiation[2])?;
        if msg_type != MessageType::Initiation {
            return Err(ControlError::Handshake(format!("expected initiation, got {msg_type:?}")));
        }
        let len = u16::from_be_bytes([initiation[3], initiation[4]]) as usize;
        if len != INITIATION_NOISE_LEN {
            return Err(ControlError::Handshake(format!("initiation declares {len} bytes")));
        }

        let key = server_key.raw32();
        let prologue = prologue(protocol_version);
        let mut hs = Builder::new(noise_params()?)
            .local_private_key(&key)
            .prologue(prologue.as_bytes())
            .build_responder()?;

        let mut payload = [0u8; MAX_MESSAGE_SIZE];
        hs.read_message(&initiation[VERSION_LEN + HEADER_LEN..], &mut payload)?;

        let peer = remote_static(&hs)?;

        let mut response = vec![0u8; HEADER_LEN + RESPONSE_NOISE_LEN];
        response[..HEADER_LEN].copy_from_slice(&header(MessageType::Response, RESPONSE_NOISE_LEN));
        let n = hs.write_message(&[], &mut response[HEADER_LEN..])?;
        if n != RESPONSE_NOISE_LEN {
            return Err(ControlError::Handshake(format!("unexpected response size {n}")));
        }

        let transport = hs.into_stateless_transport_mode()?;
        debug!(peer = %peer.short_string(), protocol_version, "noise initiation accepted");

        Ok(Self {
            peer,
            protocol_version,
            response,
            transport,
        })
    }

    /// The client's machine key.
    pub fn peer(&self) -> MachinePublic {
        self.peer
    }

    /// Protocol version announced in the initiation.
    pub fn protocol_version(&self) -> u16 {
        self.protocol_version
    }

    /// Send the response message over `io` and return the secure connection.
    pub async fn finish<T>(self, mut io: T) -> ControlResult<Conn<T>>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        io.write_all(&self.response).await?;
        io.flush().await?;
        Ok(Conn::new(io, self.transport, self.peer, self.protocol_version))
    }
}

fn remote_static(hs: &HandshakeState) -> ControlResult<MachinePublic> {
    let raw = hs
        .get_remote_static()
        .ok_or_else(|| ControlError::Handshake("peer static key missing".into()))?;
    let raw: [u8; 32] = raw
        .try_into()
        .map_err(|_| ControlError::Handshake("peer static key has wrong length".into()))?;
    Ok(MachinePublic::from_raw32(raw))
}

/// Client side of a handshake.
pub struct ClientHandshake {
    hs: HandshakeState,
    server: MachinePublic,
    protocol_version: u16,
}

impl ClientHandshake {
    /// Start a handshake towards `server`, returning the initiation message
    /// to carry in the upgrade request.
    pub fn initiate(
        machine_key: &MachinePrivate,
        server: &MachinePublic,
        protocol_version: u16,
    ) -> ControlResult<(Self, Vec<u8>)> {
        let key = machine_key.raw32();
        let prologue = prologue(protocol_version);
        let mut hs = Builder::new(noise_params()?)
            .local_private_key(&key)
            .remote_public_key(server.as_bytes())
            .prologue(prologue.as_bytes())
            .build_initiator()?;

        let mut initiation = vec![0u8; INITIATION_LEN];
        initiation[..VERSION_LEN].copy_from_slice(&protocol_version.to_be_bytes());
        initiation[VERSION_LEN..VERSION_LEN + HEADER_LEN]
            .copy_from_slice(&header(MessageType::Initiation, INITIATION_NOISE_LEN));
        let n = hs.write_message(&[], &mut initiation[VERSION_LEN + HEADER_LEN..])?;
        if n != INITIATION_NOISE_LEN {
            return Err(ControlError::Handshake(format!("unexpected initiation size {n}")));
        }

        Ok((
            Self {
                hs,
                server: *server,
                protocol_version,
            },
            initiation,
        ))
    }

    /// Read the server's response from `io` and return the secure connection.
    pub async fn complete<T>(mut self, mut io: T) -> ControlResult<Conn<T>>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let (msg_type, body) = read_frame(&mut io).await?.ok_or(ControlError::Closed)?;
        match msg_type {
            MessageType::Response => {}
            MessageType::Error => {
                return Err(ControlError::PeerError(String::from_utf8_lossy(&body).into_owned()));
            }
            other => {
                return Err(ControlError::Handshake(format!("expected response, got {other:?}")));
            }
        }
        if body.len() != RESPONSE_NOISE_LEN {
            return Err(ControlError::Handshake(format!("response has {} bytes", body.len())));
        }

        let mut payload = [0u8; MAX_MESSAGE_SIZE];
        self.hs.read_message(&body, &mut payload)?;
        let transport = self.hs.into_stateless_transport_mode()?;
        Ok(Conn::new(io, transport, self.server, self.protocol_version))
    }
}

/// Read one framed message. `Ok(None)` on a clean close before a header.
async fn read_frame<R>(r: &mut R) -> ControlResult<Option<(MessageType, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let mut hdr = [0u8; HEADER_LEN];
    match r.read_exact(&mut hdr).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let msg_type = MessageType::try_from(hdr[0])?;
    let len = u16::from_be_bytes([hdr[1], hdr[2]]) as usize;
    if len > MAX_CIPHERTEXT_SIZE {
        return Err(ControlError::InvalidMessage(format!(
            "message too large: {len} bytes (max {MAX_CIPHERTEXT_SIZE})"
        )));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok(Some((msg_type, body)))
}

fn seal(transport: &StatelessTransportState, nonce: &mut u64, plaintext: &[u8]) -> ControlResult<Vec<u8>> {
    let mut frame = vec![0u8; HEADER_LEN + plaintext.len() + TAG_LEN];
    let n = transport.write_message(*nonce, plaintext, &mut frame[HEADER_LEN..])?;
    *nonce += 1;
    frame[..HEADER_LEN].copy_from_slice(&header(MessageType::Record, n));
    frame.truncate(HEADER_LEN + n);
    Ok(frame)
}

fn open(transport: &StatelessTransportState, nonce: &mut u64, ciphertext: &[u8]) -> ControlResult<Vec<u8>> {
    let mut plaintext = vec![0u8; ciphertext.len()];
    let n = transport.read_message(*nonce, ciphertext, &mut plaintext)?;
    *nonce += 1;
    plaintext.truncate(n);
    Ok(plaintext)
}

/// Read the next record and decrypt it. `Ok(None)` when the peer closed.
async fn next_plaintext<R>(
    r: &mut R,
    transport: &StatelessTransportState,
    nonce: &mut u64,
) -> ControlResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    match read_frame(r).await? {
        None => Ok(None),
        Some((MessageType::Record, body)) => open(transport, nonce, &body).map(Some),
        Some((MessageType::Error, body)) => Err(ControlError::PeerError(
            String::from_utf8_lossy(&body).into_owned(),
        )),
        Some((other, _)) => Err(ControlError::InvalidMessage(format!(
            "unexpected {other:?} after handshake"
        ))),
    }
}

/// An established, authenticated secure connection.
pub struct Conn<T> {
    io: T,
    transport: Arc<StatelessTransportState>,
    tx_nonce: u64,
    rx_nonce: u64,
    peer: MachinePublic,
    protocol_version: u16,
}

impl<T> Conn<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn new(io: T, transport: StatelessTransportState, peer: MachinePublic, protocol_version: u16) -> Self {
        Self {
            io,
            transport: Arc::new(transport),
            tx_nonce: 0,
            rx_nonce: 0,
            peer,
            protocol_version,
        }
    }

    /// The remote machine key.
    pub fn peer(&self) -> MachinePublic {
        self.peer
    }

    /// Protocol version announced by the client.
    pub fn protocol_version(&self) -> u16 {
        self.protocol_version
    }

    /// Encrypt and send `data`, split into as many records as needed.
    pub async fn write_all(&mut self, data: &[u8]) -> ControlResult<()> {
        for chunk in data.chunks(MAX_PLAINTEXT_SIZE) {
            let frame = seal(&self.transport, &mut self.tx_nonce, chunk)?;
            self.io.write_all(&frame).await?;
        }
        self.io.flush().await?;
        Ok(())
    }

    /// Receive and decrypt one record. `Ok(None)` when the peer closed.
    pub async fn read_record(&mut self) -> ControlResult<Option<Vec<u8>>> {
        next_plaintext(&mut self.io, &self.transport, &mut self.rx_nonce).await
    }
}

impl<T> Conn<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Turn the connection into a plain byte stream.
    ///
    /// Two tasks pump bytes between the returned stream and the network,
    /// decrypting inbound records and sealing outbound writes. Dropping the
    /// stream ends the outbound pump, which closes the write side of the
    /// network connection.
    pub fn into_stream(self, capacity: usize) -> (DuplexStream, ConnPumps) {
        let (outer, inner) = tokio::io::duplex(capacity);
        let (mut net_rd, mut net_wr) = tokio::io::split(self.io);
        let (mut pipe_rd, mut pipe_wr) = tokio::io::split(inner);

        let transport = self.transport.clone();
        let mut rx_nonce = self.rx_nonce;
        let inbound = tokio::spawn(async move {
            let res = async {
                while let Some(plaintext) = next_plaintext(&mut net_rd, &transport, &mut rx_nonce).await? {
                    pipe_wr.write_all(&plaintext).await?;
                }
                trace!("secure channel: peer closed");
                Ok::<(), ControlError>(())
            }
            .await;
            // The stream must see EOF however the network side ended.
            let _ = pipe_wr.shutdown().await;
            res
        });

        let transport = self.transport;
        let mut tx_nonce = self.tx_nonce;
        let outbound = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PLAINTEXT_SIZE];
            loop {
                let n = pipe_rd.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                let frame = seal(&transport, &mut tx_nonce, &buf[..n])?;
                net_wr.write_all(&frame).await?;
                net_wr.flush().await?;
            }
            trace!("secure channel: local side closed");
            net_wr.shutdown().await?;
            Ok::<(), ControlError>(())
        });

        (
            outer,
            ConnPumps {
                inbound: Some(inbound),
                outbound,
            },
        )
    }
}

/// Handles of the two pump tasks behind [`Conn::into_stream`].
///
/// Dropping this aborts both pumps and releases the network connection.
pub struct ConnPumps {
    inbound: Option<JoinHandle<ControlResult<()>>>,
    outbound: JoinHandle<ControlResult<()>>,
}

fn join_result(res: Result<ControlResult<()>, tokio::task::JoinError>) -> ControlResult<()> {
    match res {
        Ok(res) => res,
        Err(e) => Err(ControlError::Io(std::io::Error::other(e))),
    }
}

impl ConnPumps {
    /// Resolves once the inbound pump stopped: the peer closed, the
    /// network failed, or a record did not decrypt. Pending forever after
    /// it has resolved once.
    ///
    /// Cancel safe.
    pub async fn inbound_closed(&mut self) -> ControlResult<()> {
        let Some(inbound) = self.inbound.as_mut() else {
            return std::future::pending().await;
        };
        let res = inbound.await;
        self.inbound = None;
        join_result(res)
    }

    /// Wait for the outbound pump to drain, then stop reading.
    ///
    /// Call after the stream returned by [`Conn::into_stream`] was dropped.
    pub async fn finish(mut self) -> ControlResult<()> {
        join_result((&mut self.outbound).await)
    }
}

impl Drop for ConnPumps {
    fn drop(&mut self) {
        if let Some(inbound) = &self.inbound {
            inbound.abort();
        }
        self.outbound.abort();
    }
}
