use crate::position::Position;
use crate::replica::transport::{Greeting, Handshake, PrimaryConnector, PrimarySession, Registration, StreamPacket};
use crate::replica::{FetchError, ProtocolError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::Duration;
use tokio_util::codec::{Decoder, Encoder, Framed};

// Every packet is `[u32 LE payload length][payload]`.
const LENGTH_PREFIX: usize = 4;

pub(crate) const STATUS_OK: u8 = 0x00;
pub(crate) const STATUS_EOF: u8 = 0xfe;
pub(crate) const STATUS_ERR: u8 = 0xff;
pub(crate) const COMMAND_REGISTER: u8 = 0x15;
pub(crate) const COMMAND_STREAM: u8 = 0x12;
pub(crate) const MIN_PROTOCOL_VERSION: u8 = 10;

// An EOF marker is shorter than any event.
const MAX_EOF_PACKET_LEN: usize = 9;

#[derive(Copy, Clone)]
enum DecodeState {
    Head,
    Body(usize),
}

pub(crate) struct PacketCodec {
    max_packet_size: usize,
    state: DecodeState,
}

impl PacketCodec {
    pub(crate) fn new(max_packet_size: usize) -> Self {
        PacketCodec {
            max_packet_size,
            state: DecodeState::Head,
        }
    }
}

impl Decoder for PacketCodec {
    type Item = Bytes;
    type Error = FetchError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FetchError> {
        loop {
            match self.state {
                DecodeState::Head => {
                    if src.len() < LENGTH_PREFIX {
                        return Ok(None);
                    }
                    let len = src.get_u32_le() as usize;
                    if len > self.max_packet_size {
                        return Err(ProtocolError::PacketTooLarge {
                            size: len,
                            limit: self.max_packet_size,
                        }
                        .into());
                    }
                    src.reserve(len);
                    self.state = DecodeState::Body(len);
                }
                DecodeState::Body(len) => {
                    if src.len() < len {
                        return Ok(None);
                    }
                    self.state = DecodeState::Head;
                    return Ok(Some(src.split_to(len).freeze()));
                }
            }
        }
    }
}

impl Encoder<Bytes> for PacketCodec {
    type Error = FetchError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), FetchError> {
        dst.reserve(LENGTH_PREFIX + payload.len());
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

pub(crate) struct TcpConnector {
    address: String,
    connect_timeout: Duration,
    read_timeout: Duration,
    max_packet_size: usize,
}

impl TcpConnector {
    pub(crate) fn new(host: &str, port: u16, read_timeout: Duration, max_packet_size: usize) -> Self {
        TcpConnector {
            address: format!("{}:{}", host, port),
            connect_timeout: read_timeout,
            read_timeout,
            max_packet_size,
        }
    }
}

#[async_trait::async_trait]
impl PrimaryConnector for TcpConnector {
    async fn connect(&self, handshake: &Handshake) -> Result<Box<dyn PrimarySession>, FetchError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| FetchError::Timeout)??;
        stream.set_nodelay(true)?;

        let mut io = PacketIo {
            framed: Framed::new(stream, PacketCodec::new(self.max_packet_size)),
            read_timeout: self.read_timeout,
        };

        let greeting = decode_greeting(io.read_packet().await?)?;
        io.write_packet(encode_handshake(handshake)?).await?;
        expect_ok(io.read_packet().await?)?;
        let session = TcpSession { io, greeting };

        Ok(Box::new(session))
    }
}

struct PacketIo {
    framed: Framed<TcpStream, PacketCodec>,
    read_timeout: Duration,
}

struct TcpSession {
    io: PacketIo,
    greeting: Greeting,
}

impl PacketIo {
    async fn read_packet(&mut self) -> Result<Bytes, FetchError> {
        match tokio::time::timeout(self.read_timeout, self.framed.next()).await {
            Ok(Some(packet)) => packet,
            Ok(None) => Err(FetchError::EndOfStream),
            Err(_) => Err(FetchError::Timeout),
        }
    }

    async fn write_packet(&mut self, payload: Bytes) -> Result<(), FetchError> {
        self.framed.send(payload).await
    }
}

#[async_trait::async_trait]
impl PrimarySession for TcpSession {
    fn greeting(&self) -> &Greeting {
        &self.greeting
    }

    async fn register(&mut self, registration: &Registration) -> Result<(), FetchError> {
        self.io.write_packet(encode_registration(registration)?).await?;
        expect_ok(self.io.read_packet().await?)
    }

    async fn request_stream(&mut self, from: &Position, server_id: u32) -> Result<(), FetchError> {
        self.io.write_packet(encode_stream_request(from, server_id)).await
    }

    async fn next_packet(&mut self) -> Result<StreamPacket, FetchError> {
        decode_stream_packet(self.io.read_packet().await?)
    }
}

fn put_short_text(dst: &mut BytesMut, field: &'static str, text: &str) -> Result<(), ProtocolError> {
    if text.len() > u8::MAX as usize {
        return Err(ProtocolError::FieldTooLong {
            field,
            len: text.len(),
            limit: u8::MAX as usize,
        });
    }
    dst.put_u8(text.len() as u8);
    dst.put_slice(text.as_bytes());
    Ok(())
}

fn get_short_text(src: &mut Bytes) -> Result<String, FetchError> {
    if src.is_empty() {
        return Err(ProtocolError::Malformed("missing text length").into());
    }
    let len = src.get_u8() as usize;
    if src.len() < len {
        return Err(ProtocolError::Malformed("truncated text").into());
    }
    String::from_utf8(src.split_to(len).to_vec()).map_err(|_| ProtocolError::Malformed("text is not utf-8").into())
}

pub(crate) fn decode_greeting(mut packet: Bytes) -> Result<Greeting, FetchError> {
    if packet.is_empty() {
        return Err(ProtocolError::Malformed("empty greeting").into());
    }
    if packet[0] == STATUS_ERR {
        return Err(decode_error(packet));
    }

    let protocol_version = packet.get_u8();
    let server_version = get_short_text(&mut packet)?;
    if packet.len() < 12 {
        return Err(ProtocolError::Malformed("truncated greeting").into());
    }

    Ok(Greeting {
        protocol_version,
        server_version,
        server_id: packet.get_u32_le(),
        capabilities: packet.get_u32_le(),
        unix_time: packet.get_u32_le(),
    })
}

pub(crate) fn encode_handshake(handshake: &Handshake) -> Result<Bytes, ProtocolError> {
    let mut dst = BytesMut::new();
    dst.put_u32_le(handshake.capabilities);
    dst.put_u32_le(handshake.server_id);
    dst.put_u32_le(handshake.heartbeat_period_ms);
    put_short_text(&mut dst, "user", &handshake.user)?;
    put_short_text(&mut dst, "password", &handshake.password)?;
    Ok(dst.freeze())
}

pub(crate) fn encode_registration(registration: &Registration) -> Result<Bytes, ProtocolError> {
    let mut dst = BytesMut::new();
    dst.put_u8(COMMAND_REGISTER);
    dst.put_u32_le(registration.server_id);
    put_short_text(&mut dst, "report host", &registration.host)?;
    put_short_text(&mut dst, "user", &registration.user)?;
    dst.put_u16_le(registration.port);
    Ok(dst.freeze())
}

pub(crate) fn encode_stream_request(from: &Position, server_id: u32) -> Bytes {
    let mut dst = BytesMut::new();
    dst.put_u8(COMMAND_STREAM);
    dst.put_u64_le(from.offset());
    dst.put_u16_le(0);
    dst.put_u32_le(server_id);
    dst.put_slice(from.log_name().as_bytes());
    dst.freeze()
}

fn expect_ok(packet: Bytes) -> Result<(), FetchError> {
    match packet.first() {
        Some(&STATUS_OK) => Ok(()),
        Some(&STATUS_ERR) => Err(decode_error(packet)),
        _ => Err(ProtocolError::Malformed("expected OK or ERR").into()),
    }
}

fn decode_error(mut packet: Bytes) -> FetchError {
    packet.advance(1);
    if packet.len() < 2 {
        return ProtocolError::Malformed("truncated error packet").into();
    }
    let code = packet.get_u16_le();
    let message = String::from_utf8_lossy(&packet).into_owned();
    FetchError::from_primary(code, message)
}

pub(crate) fn decode_stream_packet(mut packet: Bytes) -> Result<StreamPacket, FetchError> {
    match packet.first() {
        Some(&STATUS_OK) => {
            packet.advance(1);
            Ok(StreamPacket::Event(packet))
        }
        Some(&STATUS_EOF) if packet.len() < MAX_EOF_PACKET_LEN => Ok(StreamPacket::EndOfStream),
        Some(&STATUS_ERR) => Err(decode_error(packet)),
        _ => Err(ProtocolError::Malformed("unknown stream packet status").into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn codec_waits_for_whole_frames() {
        // -- setup --
        let mut codec = PacketCodec::new(1024);
        let mut wire = BytesMut::new();
        codec.encode(Bytes::from_static(b"hello"), &mut wire).unwrap();
        codec.encode(Bytes::from_static(b"world!"), &mut wire).unwrap();

        // -- execute & verify --
        let mut partial = wire.split_to(6);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
        partial.unsplit(wire);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(Bytes::from_static(b"hello")));
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(Bytes::from_static(b"world!")));
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
    }

    #[test]
    fn codec_rejects_oversized_frames() {
        let mut codec = PacketCodec::new(4);
        let mut wire = BytesMut::new();
        codec.encode(Bytes::from_static(b"too long"), &mut wire).unwrap();

        let result = codec.decode(&mut wire);

        assert!(matches!(
            result,
            Err(FetchError::Protocol(ProtocolError::PacketTooLarge { size: 8, limit: 4 }))
        ));
    }

    #[test]
    fn stream_packet_statuses() {
        assert_eq!(
            decode_stream_packet(Bytes::from_static(&[STATUS_OK, 1, 2, 3])).unwrap(),
            StreamPacket::Event(Bytes::from_static(&[1, 2, 3]))
        );
        assert_eq!(
            decode_stream_packet(Bytes::from_static(&[STATUS_EOF, 0, 0])).unwrap(),
            StreamPacket::EndOfStream
        );

        let mut err = BytesMut::new();
        err.put_u8(STATUS_ERR);
        err.put_u16_le(1236);
        err.put_slice(b"binlog truncated");
        let result = decode_stream_packet(err.freeze());
        assert!(matches!(
            result,
            Err(FetchError::Protocol(ProtocolError::PrimaryFatal { code: 1236, .. }))
        ));
    }

    #[test]
    fn overlong_text_fields_are_rejected() {
        let handshake = Handshake {
            capabilities: 0,
            server_id: 2,
            heartbeat_period_ms: 500,
            user: "u".repeat(256),
            password: "pw".into(),
        };

        let result = encode_handshake(&handshake);

        assert!(matches!(
            result,
            Err(ProtocolError::FieldTooLong {
                field: "user",
                len: 256,
                limit: 255
            })
        ));

        let registration = Registration {
            server_id: 2,
            host: "h".repeat(255),
            user: "repl".into(),
            port: 3307,
        };
        assert!(encode_registration(&registration).is_ok());
    }

    #[tokio::test]
    async fn tcp_handshake_and_stream_request() {
        // -- setup --
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let primary = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, PacketCodec::new(1024));

            let mut greeting = BytesMut::new();
            greeting.put_u8(MIN_PROTOCOL_VERSION);
            put_short_text(&mut greeting, "server version", "test-primary").unwrap();
            greeting.put_u32_le(1);
            greeting.put_u32_le(0);
            greeting.put_u32_le(1_000);
            framed.send(greeting.freeze()).await.unwrap();

            let handshake = framed.next().await.unwrap().unwrap();
            framed.send(Bytes::from_static(&[STATUS_OK])).await.unwrap();
            let stream_request = framed.next().await.unwrap().unwrap();
            vec![handshake, stream_request]
        });

        // -- execute --
        let connector = TcpConnector::new("127.0.0.1", port, Duration::from_secs(5), 1024);
        let handshake = Handshake {
            capabilities: 0,
            server_id: 2,
            heartbeat_period_ms: 500,
            user: "repl".into(),
            password: "pw".into(),
        };
        let mut session = connector.connect(&handshake).await.unwrap();
        session
            .request_stream(&Position::new("bin.000003", 120), 2)
            .await
            .unwrap();

        // -- verify --
        assert_eq!(session.greeting().server_id, 1);
        assert_eq!(session.greeting().server_version, "test-primary");
        let packets = primary.await.unwrap();
        assert_eq!(packets[0], encode_handshake(&handshake).unwrap());
        assert_eq!(packets[1], encode_stream_request(&Position::new("bin.000003", 120), 2));
    }

    #[tokio::test]
    async fn silent_primary_times_out() {
        // -- setup --
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _primary = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });
        let connector = TcpConnector::new("127.0.0.1", port, Duration::from_millis(100), 1024);
        let handshake = Handshake {
            capabilities: 0,
            server_id: 2,
            heartbeat_period_ms: 0,
            user: "repl".into(),
            password: "pw".into(),
        };

        // -- execute --
        let result = connector.connect(&handshake).await;

        // -- verify --
        assert!(matches!(result, Err(FetchError::Timeout)));
    }
}
